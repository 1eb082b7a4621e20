//! Profile model (C8): key mappings and macros, and the three-profile diff
//! engine (default / current / new) that decides which edits actually need
//! to go to the device.
//!
//! Callers build up a [`ProfileDiff`] from the profile read off the device,
//! make `set_*` calls as the operator requests changes, then ask for
//! [`ProfileDiff::edits`] to get the minimal packet-worthy change list.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::keys;

/// A single keyboard-event step inside a macro body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacroEvent {
    Delay(u16),
    Pressed(u8),
    Released(u8),
    ModPressed(u8),
    ModReleased(u8),
}

/// One physical key's remapping: a target HUT key code plus an optional
/// modifier that gets held while it's sent. A mapping with a modifier has
/// `to_key == 0` on the wire (the modifier occupies the slot instead); see
/// [`KeyMapping::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyMapping {
    pub to_key: u8,
    pub mod_key: u8,
}

impl KeyMapping {
    pub const DISABLED: KeyMapping = KeyMapping { to_key: keys::KEY_DISABLE, mod_key: keys::KEY_DISABLE };

    /// Validate and normalize a `(to_key, mod_key)` pair. `to_key` must be
    /// disableable-assignable; if it names a modifier, it's folded into
    /// `mod_key` and `to_key` becomes 0. A non-zero `mod_key` must itself be
    /// disableable-assignable, and a mapping can't carry two modifiers.
    pub fn new(to_key: u8, mod_key: u8) -> Result<KeyMapping> {
        if !is_assignable_disableable(to_key) {
            return Err(Error::UnsupportedMappingType(to_key));
        }
        let (to_key, mod_key) = if keys::is_modifier(to_key) {
            if mod_key != keys::KEY_DISABLE {
                return Err(Error::UnsupportedMappingType(mod_key));
            }
            (keys::KEY_DISABLE, to_key)
        } else {
            (to_key, mod_key)
        };
        if !is_assignable_disableable(mod_key) {
            return Err(Error::UnsupportedMappingType(mod_key));
        }
        Ok(KeyMapping { to_key, mod_key })
    }
}

fn is_assignable_disableable(code: u8) -> bool {
    code == keys::KEY_DISABLE || keys::is_assignable(code)
}

/// A macro: a name, a repeat count, and an ordered list of events. A macro
/// with `repeats == 0` is the device's delete sentinel regardless of its
/// event list.
#[derive(Debug, Clone)]
pub struct Macro {
    pub name: String,
    pub repeats: u16,
    pub events: Vec<MacroEvent>,
}

impl Macro {
    pub fn delete() -> Macro {
        Macro { name: String::new(), repeats: 0, events: Vec::new() }
    }

    pub fn is_delete(&self) -> bool {
        self.repeats == 0
    }
}

/// Equality ignores the name: two "delete" macros are always equal, and
/// otherwise macros compare by repeat count and event list.
impl PartialEq for Macro {
    fn eq(&self, other: &Self) -> bool {
        if self.repeats == 0 && other.repeats == 0 {
            return true;
        }
        self.repeats == other.repeats && self.events == other.events
    }
}
impl Eq for Macro {}

/// A full key-mapping and macro set, as read from or written to the device.
#[derive(Debug, Clone, Default)]
pub struct Profile {
    pub name: String,
    pub keys: BTreeMap<u8, KeyMapping>,
    pub macros: BTreeMap<u8, Macro>,
}

impl Profile {
    /// Every assignable wire key code, identity-mapped to its own HUT code,
    /// no macros. This is the factory-default layout.
    pub fn identity(assignable_keys: &[u8]) -> Profile {
        let mut keys_map = BTreeMap::new();
        for &wire_key in assignable_keys {
            if let Ok(name) = keys::name_from_key_code(wire_key) {
                if let Ok(hut) = keys::hut_code_from_name(name) {
                    keys_map.insert(wire_key, KeyMapping { to_key: hut, mod_key: keys::KEY_DISABLE });
                }
            }
        }
        Profile { name: String::new(), keys: keys_map, macros: BTreeMap::new() }
    }
}

/// One pending change the operator has requested, in the order it should be
/// sent. A macro edit's wire form (delete / rename-only / full body) is
/// entirely determined by the carried [`Macro`]'s `repeats` and `events`.
#[derive(Debug, Clone)]
pub enum Edit {
    SetName(String),
    SetKey { from_key: u8, mapping: KeyMapping },
    SetMacro { from_key: u8, macro_: Macro },
}

/// The three-profile model: `default` (factory layout, never sent),
/// `current` (last known device state), and `new` (the operator's pending
/// overlay). `set_*` calls mutate `new` only when the change isn't already
/// reflected by one of the three profiles, so [`edits`](ProfileDiff::edits)
/// naturally comes out minimal.
pub struct ProfileDiff {
    pub default: Profile,
    pub current: Profile,
    pub new: Profile,
}

impl ProfileDiff {
    pub fn new(default: Profile, current: Profile) -> ProfileDiff {
        let new = Profile { name: current.name.clone(), keys: BTreeMap::new(), macros: BTreeMap::new() };
        ProfileDiff { default, current, new }
    }

    /// Is `from_key` already mapped to something live, or (with `mapping`
    /// given) already mapped to exactly that, in any of the three profiles?
    pub fn key_in_profile(&self, from_key: u8, mapping: Option<&KeyMapping>) -> bool {
        let profiles = [&self.default, &self.current, &self.new];
        match mapping {
            None => profiles.iter().any(|p| {
                p.keys.get(&from_key).is_some_and(|m| *m != KeyMapping::DISABLED)
            }),
            Some(wanted) => profiles.iter().any(|p| p.keys.get(&from_key) == Some(wanted)),
        }
    }

    pub fn set_name(&mut self, name: String) {
        self.new.name = name;
    }

    /// Apply a key remap, unless this exact `(from_key, mapping)` pair is
    /// already live somewhere. A remapped key that used to carry a macro
    /// gets that macro deleted, since a key can't be both remapped and
    /// macro'd.
    pub fn set_key(&mut self, from_key: u8, mapping: KeyMapping) {
        if self.key_in_profile(from_key, Some(&mapping)) {
            return;
        }
        self.new.keys.insert(from_key, mapping);
        if self.current.macros.contains_key(&from_key) || self.new.macros.contains_key(&from_key) {
            self.new.macros.insert(from_key, Macro::delete());
        }
    }

    /// Apply a macro (possibly a delete, possibly a rename, possibly a full
    /// body change). Attaching a macro with events disables any live key
    /// mapping on the same slot. A rename with an unchanged body is
    /// collapsed to an events-less macro, which the protocol layer encodes
    /// as a name-only packet.
    pub fn set_macro(&mut self, from_key: u8, new_macro: Macro) {
        let current = self.current.macros.get(&from_key);
        let events_empty = new_macro.events.is_empty();

        let body_or_absent_changed = match current {
            None => true,
            Some(cur) => {
                (!events_empty && cur != &new_macro) || (events_empty && cur.name != new_macro.name)
            }
        };
        if body_or_absent_changed {
            self.new.macros.insert(from_key, new_macro.clone());
            if self.key_in_profile(from_key, None) {
                self.new.keys.insert(from_key, KeyMapping::DISABLED);
            }
            return;
        }

        let rename_only = match current {
            None => true,
            Some(cur) => !events_empty && cur == &new_macro && cur.name != new_macro.name,
        };
        if rename_only {
            let mut renamed = new_macro;
            renamed.events.clear();
            self.new.macros.insert(from_key, renamed);
        }
    }

    /// Reset the overlay to the factory layout: every assignable key
    /// identity-mapped, no macros.
    pub fn set_all_default(&mut self) {
        self.new.keys = self.default.keys.clone();
        self.new.macros.clear();
    }

    /// The minimal edit list the overlay represents: a name change (if any),
    /// then every pending key remap, then every pending macro change, each
    /// in ascending key-code order.
    pub fn edits(&self) -> Vec<Edit> {
        let mut out = Vec::new();
        if self.new.name != self.current.name {
            out.push(Edit::SetName(self.new.name.clone()));
        }
        for (&from_key, mapping) in &self.new.keys {
            out.push(Edit::SetKey { from_key, mapping: *mapping });
        }
        for (&from_key, macro_) in &self.new.macros {
            out.push(Edit::SetMacro { from_key, macro_: macro_.clone() });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diff() -> ProfileDiff {
        let default = Profile::identity(&[0x04, 0x05]);
        let current = default.clone();
        ProfileDiff::new(default, current)
    }

    #[test]
    fn key_mapping_folds_modifier_into_mod_key() {
        let m = KeyMapping::new(0xE0, 0).unwrap();
        assert_eq!(m, KeyMapping { to_key: 0, mod_key: 0xE0 });
    }

    #[test]
    fn key_mapping_rejects_double_modifier() {
        assert!(KeyMapping::new(0xE0, 0xE1).is_err());
    }

    #[test]
    fn key_mapping_rejects_unassignable_code() {
        assert!(KeyMapping::new(0x01, 0).is_err());
    }

    #[test]
    fn diff_is_empty_when_nothing_changed() {
        let d = diff();
        assert!(d.edits().is_empty());
    }

    #[test]
    fn set_key_is_noop_if_mapping_already_live() {
        let mut d = diff();
        let mapping = *d.current.keys.get(&0x04).unwrap();
        d.set_key(0x04, mapping);
        assert!(d.edits().is_empty());
    }

    #[test]
    fn set_key_deletes_existing_macro_on_same_slot() {
        let mut d = diff();
        d.current.macros.insert(0x04, Macro { name: "m".into(), repeats: 1, events: vec![MacroEvent::Delay(1)] });
        d.set_key(0x04, KeyMapping::new(0x05, 0).unwrap());
        let edits = d.edits();
        assert!(edits.iter().any(|e| matches!(e, Edit::SetKey { from_key: 0x04, .. })));
        assert!(edits.iter().any(|e| matches!(e, Edit::SetMacro { from_key: 0x04, macro_ } if macro_.is_delete())));
    }

    #[test]
    fn set_macro_disables_live_key_mapping() {
        let mut d = diff();
        d.set_macro(0x04, Macro { name: "m".into(), repeats: 1, events: vec![MacroEvent::Pressed(0x05)] });
        let edits = d.edits();
        assert!(edits.iter().any(|e| matches!(e, Edit::SetKey { from_key: 0x04, mapping } if *mapping == KeyMapping::DISABLED)));
        assert!(edits.iter().any(|e| matches!(e, Edit::SetMacro { from_key: 0x04, .. })));
    }

    #[test]
    fn set_macro_rename_only_clears_events() {
        let mut d = diff();
        let body = vec![MacroEvent::Pressed(0x05)];
        d.current.macros.insert(0x04, Macro { name: "old".into(), repeats: 1, events: body.clone() });
        d.set_macro(0x04, Macro { name: "new".into(), repeats: 1, events: body });
        let edits = d.edits();
        match edits.iter().find(|e| matches!(e, Edit::SetMacro { from_key: 0x04, .. })).unwrap() {
            Edit::SetMacro { macro_, .. } => {
                assert_eq!(macro_.name, "new");
                assert!(macro_.events.is_empty());
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn set_macro_noop_when_identical() {
        let mut d = diff();
        let m = Macro { name: "m".into(), repeats: 1, events: vec![MacroEvent::Delay(3)] };
        d.current.macros.insert(0x04, m.clone());
        d.set_macro(0x04, m);
        assert!(d.edits().is_empty());
    }

    #[test]
    fn set_all_default_clears_macros_and_restores_identity() {
        let mut d = diff();
        d.current.keys.insert(0x04, KeyMapping::new(0x05, 0).unwrap());
        d.current.macros.insert(0x04, Macro { name: "m".into(), repeats: 1, events: vec![] });
        d.set_all_default();
        assert_eq!(d.new.keys.get(&0x04), d.default.keys.get(&0x04));
        assert!(d.new.macros.is_empty());
    }
}
