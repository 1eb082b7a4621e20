//! 16-byte-per-row hex dump with an ASCII sidebar, used to render capture
//! payloads that didn't decode against any known report.

fn printable(byte: u8) -> char {
    if byte < b' ' || byte > b'~' {
        '.'
    } else {
        byte as char
    }
}

/// Render `data` as full 16-byte rows (four groups of four, a `-` between
/// the two halves, then an ASCII sidebar), followed by one partial row of
/// bare hex if `data.len()` isn't a multiple of 16.
pub fn hexdump(data: &[u8]) -> String {
    let mut out = String::new();
    let full_rows = data.len() / 16;

    for row in 0..full_rows {
        let chunk = &data[row * 16..row * 16 + 16];
        if row > 0 {
            out.push('\n');
        }
        for (i, b) in chunk.iter().enumerate() {
            if i == 8 {
                out.push('-');
            } else {
                out.push(' ');
            }
            out.push_str(&format!("{b:02X}"));
        }
        out.push_str("  ");
        for (i, &b) in chunk.iter().enumerate() {
            if i == 4 || i == 12 {
                out.push(' ');
            }
            if i == 8 {
                out.push(' ');
            }
            out.push(printable(b));
        }
    }

    if data.len() % 16 != 0 {
        if full_rows > 0 {
            out.push('\n');
        }
        out.push(' ');
        let start = full_rows * 16;
        for num in start..start + 16 {
            if num < data.len() {
                out.push_str(&format!("{:02X}", data[num]));
            } else {
                out.push_str("  ");
            }
            if num % 16 == 7 {
                out.push(' ');
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_row_contains_dash_separator_and_ascii_sidebar() {
        let data: Vec<u8> = (0..16).collect();
        let out = hexdump(&data);
        assert!(out.contains('-'));
        assert!(out.ends_with("............"));
    }

    #[test]
    fn non_printable_bytes_render_as_dot() {
        let out = hexdump(&[0x00, 0x01, b'A']);
        assert!(out.contains("00"));
        assert!(out.contains("41"));
    }

    #[test]
    fn partial_row_pads_missing_bytes_with_spaces() {
        let out = hexdump(&[0xAB]);
        assert!(out.starts_with(" AB"));
    }
}
