//! Report codec (C4): decode an interrupt payload against C3's tree, and
//! build outgoing reports by padding a payload to the report's declared size.

use crate::bits;
use crate::error::{Error, Result};
use crate::hid_tree::{Direction, Node, ReportTree};
use std::fmt::Write as _;

/// Number of bytes a report of `bit_len` bits occupies, rounded up.
fn bits_to_bytes(bit_len: u64) -> usize {
    ((bit_len + 7) / 8) as usize
}

/// Render `(report_id, direction, payload)` against the tree, walking items
/// in pre-order. Constant items advance the cursor silently; everything
/// else is rendered as hex (byte-aligned fields) or a `#`/`.` bitmap.
pub fn decode_interrupt(
    tree: &ReportTree,
    report_id: u8,
    direction: Direction,
    payload: &[u8],
) -> Result<String> {
    let reports = tree.get_reports(direction);
    let collection = reports.get(&report_id).ok_or_else(|| Error::BadReportId {
        report_id,
        direction,
        valid: reports.keys().copied().collect(),
    })?;

    let mut cursor_bits: u64 = 0;
    let mut out = String::new();
    render_collection(collection, payload, &mut cursor_bits, &mut out);
    Ok(out)
}

fn render_collection(
    collection: &crate::hid_tree::Collection,
    payload: &[u8],
    cursor_bits: &mut u64,
    out: &mut String,
) {
    for child in &collection.children {
        match child {
            Node::Collection(sub) => render_collection(sub, payload, cursor_bits, out),
            Node::Item(item) => {
                if item.is_constant() {
                    *cursor_bits += item.total_bits();
                    continue;
                }
                if !out.is_empty() {
                    out.push(' ');
                }
                out.push('[');
                for field in 0..item.count {
                    if field > 0 {
                        out.push(' ');
                    }
                    let byte_offset = (*cursor_bits / 8) as usize;
                    let bit_offset = (*cursor_bits % 8) as usize;
                    let value = bits::extract(
                        payload,
                        byte_offset,
                        bit_offset,
                        item.bit_size as usize,
                    );
                    if item.bit_size % 8 == 0 {
                        for (i, byte) in value.iter().enumerate() {
                            if i > 0 {
                                out.push(' ');
                            }
                            let _ = write!(out, "{byte:02X}");
                        }
                    } else {
                        for bit in 0..item.bit_size {
                            let byte = value[(bit / 8) as usize];
                            let set = byte & (0x80 >> (bit % 8)) != 0;
                            out.push(if set { '#' } else { '.' });
                        }
                    }
                    *cursor_bits += item.bit_size as u64;
                }
                out.push(']');
            }
        }
    }
}

/// Size, in bytes, of report `report_id` for `direction`.
pub fn report_size_bytes(tree: &ReportTree, report_id: u8, direction: Direction) -> Result<usize> {
    let reports = tree.get_reports(direction);
    let collection = reports.get(&report_id).ok_or_else(|| Error::BadReportId {
        report_id,
        direction,
        valid: reports.keys().copied().collect(),
    })?;
    Ok(bits_to_bytes(collection.total_bits()))
}

/// Build an outgoing report: `report_id` followed by `payload`, zero-padded
/// to the declared size. `payload` longer than the report's size is a
/// programmer error, not a runtime one.
pub fn generate_report(tree: &ReportTree, report_id: u8, payload: &[u8]) -> Result<Vec<u8>> {
    let size = report_size_bytes(tree, report_id, Direction::Out)?;
    assert!(
        payload.len() <= size,
        "payload of {} bytes exceeds report {} size of {} bytes",
        payload.len(),
        report_id,
        size
    );
    let mut buf = Vec::with_capacity(size + 1);
    buf.push(report_id);
    buf.extend_from_slice(payload);
    buf.resize(size + 1, 0);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hid_tree::decode_report_descriptor;

    fn byte_aligned_tree() -> ReportTree {
        let desc = vec![
            0x06, 0x00, 0xFF, // Usage Page (vendor)
            0xA1, 0x01, // Collection (Application)
            0x85, 82, //   Report ID (82)
            0x75, 0x08, //   Report Size 8
            0x95, 32, //   Report Count 32
            0x19, 0x00, 0x29, 0xFF, //   Usage Min/Max
            0x91, 0x02, //   Output (Data, Var, Abs)
            0xC0,
        ];
        let root = decode_report_descriptor(&desc).unwrap();
        ReportTree { root }
    }

    #[test]
    fn report_size_is_32_bytes() {
        let tree = byte_aligned_tree();
        assert_eq!(report_size_bytes(&tree, 82, Direction::Out).unwrap(), 32);
    }

    #[test]
    fn generate_report_pads_with_zeroes() {
        let tree = byte_aligned_tree();
        let payload = vec![1, 2, 3];
        let report = generate_report(&tree, 82, &payload).unwrap();
        assert_eq!(report.len(), 33);
        assert_eq!(report[0], 82);
        assert_eq!(&report[1..4], &[1, 2, 3]);
        assert!(report[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn bad_report_id_lists_valid_ones() {
        let tree = byte_aligned_tree();
        let err = report_size_bytes(&tree, 5, Direction::Out).unwrap_err();
        match err {
            Error::BadReportId { report_id, valid, .. } => {
                assert_eq!(report_id, 5);
                assert_eq!(valid, vec![82]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
