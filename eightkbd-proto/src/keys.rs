//! Static key-name lookup tables: HID Usage Table keyboard-page names and
//! this device's custom key codes (external keys, modifiers). Treated as
//! plain data, not logic — bidirectional lookups only.

use crate::error::{Error, Result};

/// HUT keyboard-page usage names, indexed by HUT code.
pub const HUT_KEYS: &[&str] = &[
    "reserved-00", "errorrollover", "errorpostfail", "errorundefined",
    "a", "b", "c", "d", "e", "f", "g", "h", "i", "j", "k", "l", "m", "n", "o",
    "p", "q", "r", "s", "t", "u", "v", "w", "x", "y", "z", "1", "2", "3", "4",
    "5", "6", "7", "8", "9", "0", "enter", "escape", "backspace", "tab",
    "spacebar", "-", "=", "[", "]", "\\", "non-us-#", ";", "'", "`", ",", ".",
    "/", "caps-lock", "f1", "f2", "f3", "f4", "f5", "f6", "f7", "f8", "f9",
    "f10", "f11", "f12", "print-screen", "scroll-lock", "pause", "insert",
    "home", "page-up", "delete", "end", "page-down", "right-arrow",
    "left-arrow", "down-arrow", "up-arrow", "kp-num-lock", "kp/", "kp*", "kp-",
    "kp+", "kp-enter", "kp1", "kp2", "kp3", "kp4", "kp5", "kp6", "kp7", "kp8",
    "kp9", "kp0", "kp.", "non-us-\\", "menu", "power", "kp=", "f13", "f14",
    "f15", "f16", "f17", "f18", "f19", "f20", "f21", "f22", "f23", "f24",
    "execute", "help", "sun-props", "select", "stop", "again", "undo", "cut",
    "copy", "paste", "find", "mute", "volume-up", "volume-down",
    "locking-caps-lock", "locking-num-lock", "locking-scroll-lock", "kp,",
    "as400-kp=", "intl-1", "intl-2", "intl-3", "intl-4", "intl-5", "intl-6",
    "intl-7", "intl-8", "intl-9", "lang-1", "lang-2", "lang-3", "lang-4",
    "lang-5", "lang-6", "lang-7", "lang-8", "lang-9", "alt-erase", "sysrq",
    "cancel", "clear", "prior", "return", "separator", "out", "oper",
    "clear/again", "crsel/props", "exsel", "reserved-a5", "reserved-a6",
    "reserved-a7", "reserved-a8", "reserved-a9", "reserved-aa", "reserved-ab",
    "reserved-ac", "reserved-ad", "reserved-ae", "reserved-af", "kp00",
    "kp000", "thousands-separator", "decimal-separator", "currency",
    "currency-subunit", "kp(", "kp)", "kp{", "kp}", "kp-tab", "kp-backspace",
    "kp-a", "kp-b", "kp-c", "kp-d", "kp-e", "kp-f", "kp-xor", "kp^", "kp%",
    "kp<", "kp>", "kp&", "kp&&", "kp|", "kp||", "kp:", "kp#", "kp-space",
    "kp@", "kp!", "kp-memory-store", "kp-memory-recall", "kp-memory-clear",
    "kp-memory-add", "kp-memory-subtract", "kp-memory-multiply",
    "kp-memory-divide", "kp-sign", "kp-clear", "kp-clear-entry", "kp-binary",
    "kp-octal", "kp-decimal", "kp-hexadecimal", "reserved-de", "reserved-df",
    "left-control", "left-shift", "left-alt", "left-win", "right-control",
    "right-shift", "right-alt", "right-win",
];

/// This device's vendor-specific physical key codes that have no HUT
/// meaning: modifiers A/B and the eight external keys, keyed by raw wire
/// key code.
pub const EIGHTKBD_KEY_NAMES: &[(u8, &str)] = &[
    (0x6C, "modifier-a"),
    (0x6D, "modifier-b"),
    (0x6E, "external-ya"),
    (0x6F, "external-yb"),
    (0x70, "external-xa"),
    (0x71, "external-xb"),
    (0x72, "external-ba"),
    (0x73, "external-bb"),
    (0x74, "external-aa"),
    (0x75, "external-ab"),
];

/// Raw wire key code -> HUT code, or 0 when the key has no HUT equivalent
/// (custom keys named in [`EIGHTKBD_KEY_NAMES`]).
pub const EIGHTKBD_KEY_VALUES: &[(u8, u8)] = &[
    (0x04, 0x04), (0x05, 0x05), (0x06, 0x06), (0x07, 0x07), (0x08, 0x08),
    (0x09, 0x09), (0x0A, 0x0A), (0x0B, 0x0B), (0x0C, 0x0C), (0x0D, 0x0D),
    (0x0E, 0x0E), (0x0F, 0x0F), (0x10, 0x10), (0x11, 0x11), (0x12, 0x12),
    (0x13, 0x13), (0x14, 0x14), (0x15, 0x15), (0x16, 0x16), (0x17, 0x17),
    (0x18, 0x18), (0x19, 0x19), (0x1A, 0x1A), (0x1B, 0x1B), (0x1C, 0x1C),
    (0x1D, 0x1D),
    (0x1E, 0x1E), (0x1F, 0x1F), (0x20, 0x20), (0x21, 0x21), (0x22, 0x22),
    (0x23, 0x23), (0x24, 0x24), (0x25, 0x25), (0x26, 0x26), (0x27, 0x27),
    (0x28, 0x28), (0x29, 0x29), (0x2A, 0x2A), (0x2B, 0x2B), (0x2C, 0x2C),
    (0x2D, 0x2D), (0x2E, 0x2E), (0x2F, 0x2F), (0x30, 0x30), (0x31, 0x31),
    (0x33, 0x33), (0x34, 0x34), (0x35, 0x35), (0x36, 0x36), (0x37, 0x37),
    (0x38, 0x38), (0x39, 0x39), (0x3A, 0x3A), (0x3B, 0x3B), (0x3C, 0x3C),
    (0x3D, 0x3D), (0x3E, 0x3E), (0x3F, 0x3F), (0x40, 0x40), (0x41, 0x41),
    (0x42, 0x42), (0x43, 0x43), (0x44, 0x44), (0x45, 0x45), (0x46, 0x46),
    (0x47, 0x47), (0x48, 0x48), (0x49, 0x49), (0x4A, 0x4A), (0x4B, 0x4B),
    (0x4C, 0x4C), (0x4D, 0x4D), (0x4E, 0x4E), (0x4F, 0x4F), (0x50, 0x50),
    (0x51, 0x51), (0x52, 0x52),
    (0x64, 0xE0), (0x65, 0xE1), (0x66, 0xE2), (0x67, 0xE3), (0x68, 0xE4),
    (0x69, 0xE5), (0x6A, 0xE6), (0x6C, 0x00), (0x6D, 0x00),
    (0x6E, 0x00), (0x6F, 0x00), (0x70, 0x00), (0x71, 0x00), (0x72, 0x00),
    (0x73, 0x00), (0x74, 0x00), (0x75, 0x00),
];

pub const KEYS_UNASSIGNABLE: &[u8] = &[0x00, 0x01, 0x02, 0x03, 0x78, 0x79, 0x7A, 0x85, 0x86, 0x9E];

pub const KEYS_MODIFIERS: &[u8] = &[0xE0, 0xE1, 0xE2, 0xE3, 0xE4, 0xE5, 0xE6, 0xE7];

pub const DISABLE_NAME: &str = "disabled";
pub const KEY_DISABLE: u8 = 0;

pub fn is_modifier(code: u8) -> bool {
    KEYS_MODIFIERS.contains(&code)
}

pub fn is_assignable(wire_key: u8) -> bool {
    !KEYS_UNASSIGNABLE.contains(&wire_key)
}

/// Human-readable name for a raw wire key code: its HUT name if it maps to
/// one, otherwise its custom device-specific name.
pub fn name_from_key_code(wire_key: u8) -> Result<&'static str> {
    let hut = EIGHTKBD_KEY_VALUES
        .iter()
        .find(|(k, _)| *k == wire_key)
        .map(|(_, v)| *v)
        .ok_or_else(|| Error::UnknownKeyName(format!("{wire_key:#04x}")))?;
    if hut == 0 {
        EIGHTKBD_KEY_NAMES
            .iter()
            .find(|(k, _)| *k == wire_key)
            .map(|(_, name)| *name)
            .ok_or_else(|| Error::UnknownKeyName(format!("{wire_key:#04x}")))
    } else {
        HUT_KEYS
            .get(hut as usize)
            .copied()
            .ok_or_else(|| Error::UnknownKeyName(format!("{wire_key:#04x}")))
    }
}

/// Raw wire key code for a key name: a HUT name, one of this device's
/// custom names, or a bare numeric code.
pub fn key_code_from_name(name: &str) -> Result<u8> {
    let lower = name.to_lowercase();
    let code = if let Ok(n) = parse_arg_num(&lower) {
        n
    } else if let Some(pos) = HUT_KEYS.iter().position(|k| *k == lower) {
        pos as u8
    } else if let Some((wire, _)) = EIGHTKBD_KEY_NAMES.iter().find(|(_, n)| *n == lower) {
        *wire
    } else {
        return Err(Error::UnknownKeyName(name.to_string()));
    };
    if !EIGHTKBD_KEY_VALUES.iter().any(|(k, _)| *k == code) {
        return Err(Error::UnknownKeyName(format!("{name} isn't on this keyboard")));
    }
    Ok(code)
}

/// HUT code for a key name, or [`KEY_DISABLE`] for the literal "disabled".
pub fn hut_code_from_name(name: &str) -> Result<u8> {
    let lower = name.to_lowercase();
    if let Ok(n) = parse_arg_num(&lower) {
        if n as usize > HUT_KEYS.len() {
            return Err(Error::UnknownKeyName(format!(
                "numeric value {n} doesn't map to a named key"
            )));
        }
        return Ok(n);
    }
    if lower == DISABLE_NAME {
        return Ok(KEY_DISABLE);
    }
    HUT_KEYS
        .iter()
        .position(|k| *k == lower)
        .map(|p| p as u8)
        .ok_or_else(|| Error::UnknownKeyName(name.to_string()))
}

/// Like [`hut_code_from_name`] but requires the result to be a modifier code.
pub fn mod_code_from_name(name: &str) -> Result<u8> {
    let code = hut_code_from_name(name)?;
    if !is_modifier(code) {
        return Err(Error::UnknownKeyName(format!("{name} is not a modifier")));
    }
    Ok(code)
}

fn parse_arg_num(s: &str) -> std::result::Result<u8, ()> {
    if let Some(hex) = s.strip_prefix("0x") {
        u8::from_str_radix(hex, 16).map_err(|_| ())
    } else {
        s.parse::<u8>().map_err(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hut_keys_index_a_is_correct() {
        assert_eq!(HUT_KEYS[0x04], "a");
        assert_eq!(HUT_KEYS[0x28], "enter");
    }

    #[test]
    fn name_from_key_code_resolves_custom_keys() {
        assert_eq!(name_from_key_code(0x6C).unwrap(), "modifier-a");
        assert_eq!(name_from_key_code(0x04).unwrap(), "a");
    }

    #[test]
    fn key_code_from_name_round_trips() {
        assert_eq!(key_code_from_name("a").unwrap(), 0x04);
        assert_eq!(key_code_from_name("modifier-a").unwrap(), 0x6C);
    }

    #[test]
    fn hut_code_from_name_recognizes_disabled() {
        assert_eq!(hut_code_from_name("disabled").unwrap(), KEY_DISABLE);
    }

    #[test]
    fn mod_code_from_name_rejects_non_modifiers() {
        assert!(mod_code_from_name("a").is_err());
        assert_eq!(mod_code_from_name("left-control").unwrap(), 0xE0);
    }
}
