//! UTF-16BE name codec (C9) with two on-wire quirks: a byte-swap for space
//! characters, and a trailing-zero-byte truncation convention.

use crate::error::{Error, Result};

const SWAPPED_SPACE: [u8; 2] = [0x20, 0x00];
const PLAIN_SPACE: [u8; 2] = [0x00, 0x20];

fn is_high_surrogate(unit: u16) -> bool {
    (0xD800..=0xDBFF).contains(&unit)
}

/// Encode `text` as the device's quirked UTF-16BE, truncating to fit within
/// `max_bytes` if necessary. Truncation never splits a surrogate pair.
pub fn encode_name(text: &str, max_bytes: usize) -> Result<Vec<u8>> {
    let units: Vec<u16> = text.encode_utf16().collect();
    let mut take = units.len();

    loop {
        let encoded = quirk_encode(&units[..take]);
        if encoded.len() <= max_bytes {
            return Ok(encoded);
        }
        if take == 0 {
            return Err(Error::NameUnencodable { max_bytes });
        }
        take -= 1;
        while take > 0 && is_high_surrogate(units[take - 1]) {
            take -= 1;
        }
    }
}

fn quirk_encode(units: &[u16]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(units.len() * 2);
    for &unit in units {
        let be = unit.to_be_bytes();
        if be == PLAIN_SPACE {
            raw.extend_from_slice(&SWAPPED_SPACE);
        } else {
            raw.extend_from_slice(&be);
        }
    }
    if raw.last() == Some(&0) {
        raw.pop();
    }
    raw
}

/// Decode the device's quirked UTF-16BE bytes back into a string.
pub fn decode_name(bytes: &[u8]) -> String {
    let mut buf = bytes.to_vec();
    if buf.len() % 2 != 0 {
        buf.push(0);
    }
    let units: Vec<u16> = buf
        .chunks_exact(2)
        .map(|chunk| {
            if chunk == SWAPPED_SPACE {
                u16::from_be_bytes(PLAIN_SPACE)
            } else {
                u16::from_be_bytes([chunk[0], chunk[1]])
            }
        })
        .collect();
    String::from_utf16_lossy(&units)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_with_spaces_and_trailing_zero_round_trips() {
        // "A b": 0041 0020 0062 -> quirked 0041 2000 0062, last byte 0x62
        // so nothing gets dropped and the encoding is the full 6 bytes.
        let encoded = encode_name("A b", 6).unwrap();
        assert_eq!(encoded, vec![0x00, 0x41, 0x20, 0x00, 0x00, 0x62]);
        assert_eq!(decode_name(&encoded), "A b");
    }

    #[test]
    fn trailing_zero_byte_is_dropped_and_restored() {
        // U+0100 -> 01 00, trailing zero dropped on write.
        let encoded = encode_name("\u{0100}", 2).unwrap();
        assert_eq!(encoded, vec![0x01]);
        assert_eq!(decode_name(&encoded), "\u{0100}");
    }

    #[test]
    fn plain_ascii_round_trips() {
        let encoded = encode_name("hello", 32).unwrap();
        assert_eq!(decode_name(&encoded), "hello");
    }

    #[test]
    fn truncation_does_not_split_surrogate_pair() {
        // Two 4-byte (surrogate pair) emoji code points, only room for one.
        let text = "\u{1F600}\u{1F601}";
        let encoded = encode_name(text, 5).unwrap();
        // 5 bytes isn't enough for one whole 4-byte pair plus anything else;
        // the encoder must drop down to 4 bytes (one whole pair), never 5
        // bytes of a split pair.
        assert_eq!(encoded.len(), 4);
        assert_eq!(decode_name(&encoded), "\u{1F600}");
    }

    #[test]
    fn unencodable_when_max_bytes_is_zero_and_text_nonempty() {
        // Even a single surrogate half cannot fit in 0 bytes.
        let err = encode_name("a", 0).unwrap_err();
        assert!(matches!(err, Error::NameUnencodable { max_bytes: 0 }));
    }

    #[test]
    fn empty_name_encodes_to_empty_bytes() {
        assert_eq!(encode_name("", 6).unwrap(), Vec::<u8>::new());
    }
}
