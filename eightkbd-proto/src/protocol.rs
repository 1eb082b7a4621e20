//! Keyboard wire protocol (C7): opcodes, packet encoders/decoders, and the
//! multi-packet reassembly rules for the GET_* commands. Everything here
//! works on report *bodies* (no leading report-id byte); the transport layer
//! owns prefixing [`OUT_REPORT_ID`] on write and stripping [`IN_REPORT_ID`]
//! on read.

use crate::error::{Error, Result};
use crate::names;
use crate::profile::{Edit, KeyMapping, Macro, MacroEvent};

pub const OUT_REPORT_ID: u8 = 82;
pub const IN_REPORT_ID: u8 = 84;

const RESPONSE_CODE: u8 = 0xE4;
const RESPONSE_SUCCESS: u8 = 0x08;

const SET_TYPE_KBD: u8 = 7;
const CMD_SET_KEY_PREFIX: [u8; 7] = [0xFA, 0x03, 0x0C, 0x00, 0xAA, 0x09, 0x71];

const CMD_SET_NAME: u8 = 0x70;
const CMD_SET_MACRO_NAME: u8 = 0x74;
const CMD_SET_MACRO: u8 = 0x76;
const CMD_DELETE_MACRO: u8 = 0x77;
const DELETE_MACRO_CONST: u8 = 0x8C;
const CMD_MACRO_MORE: u8 = 1;
const CMD_MACRO_CONST: u8 = 0x01;

const CMD_GET_NAME: u8 = 0x80;
const CMD_GET_KEYS: u8 = 0x81;
const CMD_GET_MACROS: u8 = 0x82;
const CMD_GET_KEY: u8 = 0x83;
const CMD_GET_MACRO_NAME: u8 = 0x84;
const CMD_GET_MACRO: u8 = 0x86;

const ACTION_DELAY: u8 = 0x0F;
const ACTION_RELEASED: u8 = 0x01;
const ACTION_MOD_RELEASED: u8 = 0x03;
const ACTION_PRESSED: u8 = 0x81;
const ACTION_MOD_PRESSED: u8 = 0x83;

const NAME_HDR_LEN: usize = 3;
const MACRO_NAME_HDR_LEN: usize = 4;
const MACRO_PKT_HDR_LEN: usize = 6;
const MACRO_BODY_HDR_LEN: usize = 4;
const MACRO_EVENT_LEN: usize = 3;

fn padded(mut buf: Vec<u8>, packet_len: usize) -> Vec<u8> {
    buf.resize(packet_len, 0);
    buf
}

/// True iff `data` (a report body, no report-id byte) is the device's
/// generic command-accepted acknowledgement.
pub fn check_success(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == RESPONSE_CODE && data[1] == RESPONSE_SUCCESS
}

pub fn encode_get_name(packet_len: usize) -> Vec<u8> {
    padded(vec![CMD_GET_NAME], packet_len)
}

pub fn encode_get_keys(packet_len: usize) -> Vec<u8> {
    padded(vec![CMD_GET_KEYS], packet_len)
}

pub fn encode_get_macros(packet_len: usize) -> Vec<u8> {
    padded(vec![CMD_GET_MACROS], packet_len)
}

pub fn encode_get_key(from_key: u8, packet_len: usize) -> Vec<u8> {
    padded(vec![CMD_GET_KEY, from_key], packet_len)
}

pub fn encode_get_macro_name(from_key: u8, packet_len: usize) -> Vec<u8> {
    padded(vec![CMD_GET_MACRO_NAME, from_key], packet_len)
}

pub fn encode_get_macro(from_key: u8, packet_len: usize) -> Vec<u8> {
    padded(vec![CMD_GET_MACRO, from_key], packet_len)
}

fn encode_set_key(from_key: u8, mapping: KeyMapping, packet_len: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(packet_len);
    buf.extend_from_slice(&CMD_SET_KEY_PREFIX);
    buf.push(from_key);
    buf.push(SET_TYPE_KBD);
    buf.push(mapping.mod_key);
    buf.push(mapping.to_key);
    padded(buf, packet_len)
}

fn encode_delete_macro(from_key: u8, packet_len: usize) -> Vec<u8> {
    padded(vec![CMD_DELETE_MACRO, from_key, DELETE_MACRO_CONST], packet_len)
}

fn encode_set_name_body(name_bytes: &[u8], packet_len: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(packet_len);
    buf.push(CMD_SET_NAME);
    buf.extend_from_slice(&(name_bytes.len() as u16).to_le_bytes());
    buf.extend_from_slice(name_bytes);
    padded(buf, packet_len)
}

fn encode_set_macro_name_body(from_key: u8, name_bytes: &[u8], packet_len: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(packet_len);
    buf.push(CMD_SET_MACRO_NAME);
    buf.push(from_key);
    buf.extend_from_slice(&(name_bytes.len() as u16).to_le_bytes());
    buf.extend_from_slice(name_bytes);
    padded(buf, packet_len)
}

fn macro_event_bytes(event: MacroEvent) -> [u8; MACRO_EVENT_LEN] {
    let (action, arg) = match event {
        MacroEvent::Delay(d) => (ACTION_DELAY, d),
        MacroEvent::Pressed(k) => (ACTION_PRESSED, k as u16),
        MacroEvent::Released(k) => (ACTION_RELEASED, k as u16),
        MacroEvent::ModPressed(k) => (ACTION_MOD_PRESSED, k as u16),
        MacroEvent::ModReleased(k) => (ACTION_MOD_RELEASED, k as u16),
    };
    let arg = arg.to_le_bytes();
    [action, arg[0], arg[1]]
}

fn decode_macro_event(action: u8, arg: u16) -> Result<MacroEvent> {
    Ok(match action {
        ACTION_DELAY => MacroEvent::Delay(arg),
        ACTION_PRESSED => MacroEvent::Pressed(arg as u8),
        ACTION_RELEASED => MacroEvent::Released(arg as u8),
        ACTION_MOD_PRESSED => MacroEvent::ModPressed(arg as u8),
        ACTION_MOD_RELEASED => MacroEvent::ModReleased(arg as u8),
        other => return Err(Error::MalformedDescriptor(format!("unknown macro event action {other:#04x}"))),
    })
}

/// Chunk a macro's body (header + events) into `packet_len`-sized SET_MACRO
/// packets. Packet 0 carries the body header (`reserve` bytes) plus whole
/// events out of `eventsbuf[0..]`; later packets carry only events, so fewer
/// whole events fit in packet 0 than in the packets that follow it.
fn encode_macro_body_chunks(from_key: u8, macro_: &Macro, packet_len: usize) -> Vec<Vec<u8>> {
    let mut eventsbuf = Vec::with_capacity(MACRO_BODY_HDR_LEN + macro_.events.len() * MACRO_EVENT_LEN);
    eventsbuf.push(CMD_MACRO_CONST);
    eventsbuf.extend_from_slice(&macro_.repeats.to_le_bytes());
    eventsbuf.push(macro_.events.len() as u8);
    for &event in &macro_.events {
        eventsbuf.extend_from_slice(&macro_event_bytes(event));
    }

    let mut chunks = Vec::new();
    let mut pos = 0usize;
    while pos < eventsbuf.len() {
        let mut reserve = 0usize;
        if pos == 0 {
            reserve = MACRO_BODY_HDR_LEN;
        }
        let this_items = (packet_len - MACRO_PKT_HDR_LEN - reserve) / MACRO_EVENT_LEN;
        let mut items_len = reserve + this_items * MACRO_EVENT_LEN;
        let mut more = CMD_MACRO_MORE;
        if pos + items_len >= eventsbuf.len() {
            items_len = eventsbuf.len() - pos;
            more = 0;
        }
        let mut buf = Vec::with_capacity(packet_len);
        buf.push(CMD_SET_MACRO);
        buf.push(from_key);
        buf.push(more);
        buf.extend_from_slice(&(pos as u16).to_le_bytes());
        buf.push(items_len as u8);
        buf.extend_from_slice(&eventsbuf[pos..pos + items_len]);
        chunks.push(padded(buf, packet_len));
        pos += items_len;
    }
    chunks
}

/// Encode `edit` into the packets it takes on the wire, each tagged with
/// whether the submit loop should wait for a success acknowledgement before
/// sending the next one.
pub fn encode_edit(edit: &Edit, packet_len: usize) -> Result<Vec<(Vec<u8>, bool)>> {
    match edit {
        Edit::SetName(name) => {
            let name_bytes = names::encode_name(name, packet_len - NAME_HDR_LEN)?;
            Ok(vec![(encode_set_name_body(&name_bytes, packet_len), true)])
        }
        Edit::SetKey { from_key, mapping } => {
            Ok(vec![(encode_set_key(*from_key, *mapping, packet_len), true)])
        }
        Edit::SetMacro { from_key, macro_ } => encode_macro_edit(*from_key, macro_, packet_len),
    }
}

fn encode_macro_edit(from_key: u8, macro_: &Macro, packet_len: usize) -> Result<Vec<(Vec<u8>, bool)>> {
    if macro_.is_delete() {
        return Ok(vec![(encode_delete_macro(from_key, packet_len), true)]);
    }
    let name_bytes = names::encode_name(&macro_.name, packet_len - MACRO_NAME_HDR_LEN)?;
    let name_packet = encode_set_macro_name_body(from_key, &name_bytes, packet_len);
    if macro_.events.is_empty() {
        return Ok(vec![(name_packet, true)]);
    }
    let body_chunks = encode_macro_body_chunks(from_key, macro_, packet_len);
    let last = body_chunks.len() - 1;
    let mut out = vec![(name_packet, true)];
    out.extend(body_chunks.into_iter().enumerate().map(|(i, chunk)| (chunk, i == last)));
    Ok(out)
}

/// Parse a GET_NAME response body (header + name bytes) into a name.
pub fn decode_name_response(data: &[u8]) -> Result<String> {
    if data.len() < NAME_HDR_LEN {
        return Err(Error::MalformedDescriptor("name response too short".into()));
    }
    let len = u16::from_le_bytes([data[1], data[2]]) as usize;
    let end = (NAME_HDR_LEN + len).min(data.len());
    Ok(names::decode_name(&data[NAME_HDR_LEN..end]))
}

/// Parse a GET_KEY response body into `(from_key, mapping)`.
pub fn decode_key_response(data: &[u8]) -> Result<(u8, KeyMapping)> {
    if data.len() < 5 {
        return Err(Error::MalformedDescriptor("key response too short".into()));
    }
    let from_key = data[1];
    let map_type = data[2];
    if map_type != SET_TYPE_KBD {
        return Err(Error::UnsupportedMappingType(map_type));
    }
    let mapping = KeyMapping::new(data[4], data[3])?;
    Ok((from_key, mapping))
}

/// Accumulates the multi-packet GET_KEYS / GET_MACROS key-code lists: each
/// packet's final byte is a continuation marker, dropped from the buffer; a
/// packet whose final byte is 0 ends the list.
#[derive(Default)]
pub struct ListAccumulator {
    buf: Vec<u8>,
    done: bool,
}

impl ListAccumulator {
    pub fn new() -> ListAccumulator {
        ListAccumulator::default()
    }

    pub fn push(&mut self, payload: &[u8]) {
        if payload.is_empty() {
            self.done = true;
            return;
        }
        if *payload.last().unwrap() == 0 {
            self.done = true;
        }
        self.buf.extend_from_slice(&payload[..payload.len() - 1]);
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Extract the key-code list: every `stride`-th byte starting at offset
    /// 1 (skipping the echoed opcode), stopping at the first zero.
    pub fn key_list(&self, stride: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut i = 1;
        while i < self.buf.len() {
            let code = self.buf[i];
            if code == 0 {
                break;
            }
            out.push(code);
            i += stride;
        }
        out
    }
}

/// Accumulates the multi-packet GET_MACRO body: unlike
/// [`ListAccumulator`], chunks carry an explicit `pos` that must exactly
/// match the buffer accumulated so far, or the device sent them out of
/// order.
#[derive(Default)]
pub struct MacroAccumulator {
    buf: Vec<u8>,
    done: bool,
}

impl MacroAccumulator {
    pub fn new() -> MacroAccumulator {
        MacroAccumulator::default()
    }

    pub fn push(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() < MACRO_PKT_HDR_LEN {
            return Err(Error::MalformedDescriptor("macro chunk too short".into()));
        }
        let more = payload[2];
        let pos = u16::from_le_bytes([payload[3], payload[4]]);
        let chunk_len = payload[5] as usize;
        if pos as usize != self.buf.len() {
            return Err(Error::BadMacroChunkOrder { expected: self.buf.len() as u16, got: pos });
        }
        let end = (MACRO_PKT_HDR_LEN + chunk_len).min(payload.len());
        self.buf.extend_from_slice(&payload[MACRO_PKT_HDR_LEN..end]);
        if more == 0 {
            self.done = true;
        }
        Ok(())
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn into_body(self) -> Vec<u8> {
        self.buf
    }
}

/// Decode a fully reassembled GET_MACRO body into repeats + events. The
/// name isn't carried here; callers fill it in from the paired
/// GET_MACRO_NAME response.
pub fn decode_macro_body(buf: &[u8]) -> Result<Macro> {
    if buf.len() < MACRO_BODY_HDR_LEN {
        return Err(Error::MalformedDescriptor("macro body too short".into()));
    }
    let repeats = u16::from_le_bytes([buf[1], buf[2]]);
    let event_count = buf[3] as usize;
    let mut events = Vec::with_capacity(event_count);
    let mut i = MACRO_BODY_HDR_LEN;
    for _ in 0..event_count {
        if i + MACRO_EVENT_LEN > buf.len() {
            return Err(Error::MalformedDescriptor("macro event truncated".into()));
        }
        let action = buf[i];
        let arg = u16::from_le_bytes([buf[i + 1], buf[i + 2]]);
        events.push(decode_macro_event(action, arg)?);
        i += MACRO_EVENT_LEN;
    }
    Ok(Macro { name: String::new(), repeats, events })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_set_key_matches_known_wire_bytes() {
        let mapping = KeyMapping::new(0x05, 0xE0).unwrap();
        let packet = encode_set_key(0x04, mapping, 11);
        assert_eq!(packet, vec![0xFA, 0x03, 0x0C, 0x00, 0xAA, 0x09, 0x71, 0x04, 0x07, 0xE0, 0x05]);
    }

    #[test]
    fn macro_body_chunks_single_packet_for_small_macro() {
        let macro_ = Macro {
            name: String::new(),
            repeats: 0x0001,
            events: vec![
                MacroEvent::Pressed(0x04),
                MacroEvent::Released(0x04),
                MacroEvent::Pressed(0x05),
                MacroEvent::Released(0x05),
            ],
        };
        let chunks = encode_macro_body_chunks(0x10, &macro_, 32);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0][0], CMD_SET_MACRO);
        assert_eq!(chunks[0][1], 0x10);
        assert_eq!(chunks[0][2], 0); // more = 0, final chunk
        assert_eq!(u16::from_le_bytes([chunks[0][3], chunks[0][4]]), 0); // pos
        assert_eq!(chunks[0][5], 16); // chunk_len: 4 header + 4*3 events
    }

    #[test]
    fn encode_edit_delete_macro_is_single_packet() {
        let edit = Edit::SetMacro { from_key: 7, macro_: Macro::delete() };
        let packets = encode_edit(&edit, 16).unwrap();
        assert_eq!(packets.len(), 1);
        assert!(packets[0].1);
        assert_eq!(packets[0].0[0], CMD_DELETE_MACRO);
        assert_eq!(packets[0].0[2], DELETE_MACRO_CONST);
    }

    #[test]
    fn encode_edit_rename_only_macro_has_no_body_chunk() {
        let macro_ = Macro { name: "hi".into(), repeats: 3, events: vec![] };
        let edit = Edit::SetMacro { from_key: 7, macro_ };
        let packets = encode_edit(&edit, 32).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].0[0], CMD_SET_MACRO_NAME);
    }

    #[test]
    fn only_final_body_chunk_waits_for_ack() {
        let events = vec![MacroEvent::Delay(1); 20];
        let macro_ = Macro { name: "x".into(), repeats: 1, events };
        let edit = Edit::SetMacro { from_key: 1, macro_ };
        let packets = encode_edit(&edit, 16).unwrap();
        assert!(packets.len() > 2, "expected multiple body chunks for 20 events in 16-byte packets");
        assert!(packets[0].1, "name packet always waits");
        for mid in &packets[1..packets.len() - 1] {
            assert!(!mid.1, "only the final body chunk should wait");
        }
        assert!(packets.last().unwrap().1);
    }

    #[test]
    fn check_success_requires_both_bytes() {
        assert!(check_success(&[0xE4, 0x08, 0x00]));
        assert!(!check_success(&[0xE4, 0x00]));
        assert!(!check_success(&[0x00]));
    }

    #[test]
    fn key_response_round_trips() {
        let packet = encode_set_key(0x04, KeyMapping::new(0x05, 0xE0).unwrap(), 11);
        // Device GET_KEY response shares MAP_KEY's tail layout: opcode, from_key, map_type, mod_key, to_key.
        let response = [0x83, 0x04, SET_TYPE_KBD, 0xE0, 0x05];
        let (from_key, mapping) = decode_key_response(&response).unwrap();
        assert_eq!(from_key, 0x04);
        assert_eq!(mapping, KeyMapping::new(0x05, 0xE0).unwrap());
        assert_eq!(&packet[7..9], &[0x04, SET_TYPE_KBD]);
    }

    #[test]
    fn list_accumulator_stops_on_zero_terminated_packet() {
        let mut acc = ListAccumulator::new();
        acc.push(&[0x81, 0x04, 1]); // not terminated (last byte 1, stripped)
        assert!(!acc.is_done());
        acc.push(&[0x81, 0x06, 0]); // terminated
        assert!(acc.is_done());
        assert_eq!(acc.key_list(2), vec![0x04, 0x06]);
    }

    #[test]
    fn macro_accumulator_rejects_out_of_order_chunks() {
        let mut acc = MacroAccumulator::new();
        let bad_chunk = [CMD_SET_MACRO, 1, 0, 4, 0, 3, 0xAA, 0xBB, 0xCC];
        let err = acc.push(&bad_chunk).unwrap_err();
        assert!(matches!(err, Error::BadMacroChunkOrder { expected: 0, got: 4 }));
    }

    #[test]
    fn macro_body_round_trips_through_decode() {
        let macro_ = Macro { name: String::new(), repeats: 5, events: vec![MacroEvent::Delay(100), MacroEvent::Pressed(0x04)] };
        let chunks = encode_macro_body_chunks(9, &macro_, 32);
        let mut acc = MacroAccumulator::new();
        for chunk in &chunks {
            acc.push(chunk).unwrap();
        }
        assert!(acc.is_done());
        let decoded = decode_macro_body(&acc.into_body()).unwrap();
        assert_eq!(decoded.repeats, 5);
        assert_eq!(decoded.events, macro_.events);
    }
}
