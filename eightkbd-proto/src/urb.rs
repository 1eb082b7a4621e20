//! USB Request Block reconstruction (C5): decodes captured usbmon `mon_bin`
//! records into a running [`UsbContext`] that tracks devices, configurations,
//! and interrupt traffic across a capture.

use std::collections::BTreeMap;
use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

use crate::descriptor::Device;
use crate::error::{Error, Result};
use crate::hid_tree::Direction;
use crate::report;

const HEADER_LEN: usize = 40;
const UNION_LEN: usize = 8;
const TAIL_LEN: usize = 16;
pub const URB_FIXED_LEN: usize = HEADER_LEN + UNION_LEN + TAIL_LEN;

const URB_TYPE_SUBMIT: u8 = b'S';
const URB_TYPE_COMPLETE: u8 = b'C';

const XFER_TYPE_ISO: u8 = 0;
const XFER_TYPE_INTERRUPT: u8 = 1;
const XFER_TYPE_CONTROL: u8 = 2;
const XFER_TYPE_BULK: u8 = 3;

const ENDPOINT_DIR_MASK: u8 = 0x80;
const ENDPOINT_MASK: u8 = 0x0F;

const FLAG_SETUP_PRESENT: u8 = 0;
const FLAG_DATA_PRESENT: u8 = b'=';

const DESC_TYPE_DEVICE: u8 = 1;
const DESC_TYPE_CONFIGURATION: u8 = 2;
const DESC_TYPE_STRING: u8 = 3;

const REQUEST_GET_DESCRIPTOR: (u8, u8) = (0x80, 0x06);
const REQUEST_SET_CONFIGURATION: (u8, u8) = (0x00, 0x09);

const ENOENT: i32 = -2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum UrbKind {
    Submit,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    Iso,
    Interrupt,
    Control,
    Bulk,
}

impl TransferType {
    fn from_raw(v: u8) -> Result<TransferType> {
        Ok(match v {
            XFER_TYPE_ISO => TransferType::Iso,
            XFER_TYPE_INTERRUPT => TransferType::Interrupt,
            XFER_TYPE_CONTROL => TransferType::Control,
            XFER_TYPE_BULK => TransferType::Bulk,
            other => return Err(Error::MalformedDescriptor(format!("unknown URB transfer type {other}"))),
        })
    }
}

/// Key identifying one USB device across a capture: bus number + device
/// address. Stable across device re-enumeration only within one address
/// assignment; a device loss (`-ENOENT`) removes its entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DevKey {
    pub busnum: u16,
    pub devnum: u8,
}

/// The setup packet of a control transfer, or the iso record in its place.
#[derive(Debug, Clone, Copy)]
pub enum UrbExtra {
    Setup { bm_request_type: u8, b_request: u8, w_value: u16, w_index: u16, w_length: u16 },
    Iso { error_count: i32, numdesc: i32 },
}

impl UrbExtra {
    fn desc_type(w_value: u16) -> u8 {
        (w_value >> 8) as u8
    }
    fn desc_index(w_value: u16) -> u8 {
        (w_value & 0xFF) as u8
    }
}

/// A single decoded URB record. Carries only what later decoding needs;
/// the reconstructor keeps the *previous* record as a non-owning snapshot
/// rather than a full back-reference chain (see module docs on `PrevUrb`).
#[derive(Debug, Clone)]
pub struct Urb {
    pub id: u64,
    pub kind: UrbKind,
    pub xfer_type: TransferType,
    pub epnum: u8,
    pub devnum: u8,
    pub busnum: u16,
    pub flag_setup: u8,
    pub flag_data: u8,
    pub ts_sec: i64,
    pub ts_usec: i32,
    pub status: i32,
    pub length: u32,
    pub len_cap: u32,
    pub extra: Option<UrbExtra>,
    pub payload: Vec<u8>,
}

impl Urb {
    pub fn dev_key(&self) -> DevKey {
        DevKey { busnum: self.busnum, devnum: self.devnum }
    }

    pub fn direction(&self) -> Direction {
        if self.epnum & ENDPOINT_DIR_MASK != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn endpoint(&self) -> u8 {
        self.epnum & ENDPOINT_MASK
    }

    pub fn is_error(&self) -> bool {
        self.status != 0 && self.status != -(libc_eintr::EINPROGRESS)
    }

    pub fn is_device_lost(&self) -> bool {
        self.status == ENOENT
    }

    pub fn has_setup(&self) -> bool {
        self.flag_setup == FLAG_SETUP_PRESENT
    }

    pub fn has_data(&self) -> bool {
        self.flag_data == FLAG_DATA_PRESENT
    }

    /// Parse one raw usbmon `mon_bin` record (header + union + tail + payload).
    pub fn parse(data: &[u8]) -> Result<Urb> {
        if data.len() < URB_FIXED_LEN {
            return Err(Error::MalformedDescriptor(format!(
                "URB record too short: {} bytes, need at least {}",
                data.len(),
                URB_FIXED_LEN
            )));
        }
        let id = LittleEndian::read_u64(&data[0..8]);
        let kind = match data[8] {
            URB_TYPE_SUBMIT => UrbKind::Submit,
            URB_TYPE_COMPLETE => UrbKind::Complete,
            other => return Err(Error::MalformedDescriptor(format!("unknown URB type byte {other:#04x}"))),
        };
        let xfer_type = TransferType::from_raw(data[9])?;
        let epnum = data[10];
        let devnum = data[11];
        let busnum = LittleEndian::read_u16(&data[12..14]);
        let flag_setup = data[14];
        let flag_data = data[15];
        let ts_sec = LittleEndian::read_i64(&data[16..24]);
        let ts_usec = LittleEndian::read_i32(&data[24..28]);
        let status = LittleEndian::read_i32(&data[28..32]);
        let length = LittleEndian::read_u32(&data[32..36]);
        let len_cap = LittleEndian::read_u32(&data[36..40]);

        let union_bytes = &data[HEADER_LEN..HEADER_LEN + UNION_LEN];
        let extra = if xfer_type == TransferType::Control && flag_setup == FLAG_SETUP_PRESENT {
            Some(UrbExtra::Setup {
                bm_request_type: union_bytes[0],
                b_request: union_bytes[1],
                w_value: LittleEndian::read_u16(&union_bytes[2..4]),
                w_index: LittleEndian::read_u16(&union_bytes[4..6]),
                w_length: LittleEndian::read_u16(&union_bytes[6..8]),
            })
        } else if xfer_type == TransferType::Iso {
            Some(UrbExtra::Iso {
                error_count: LittleEndian::read_i32(&union_bytes[0..4]),
                numdesc: LittleEndian::read_i32(&union_bytes[4..8]),
            })
        } else {
            None
        };

        let payload = data[URB_FIXED_LEN..].to_vec();
        if (len_cap as usize) < payload.len() && len_cap != 0 {
            log::info!("URB {id:x}: captured {len_cap} of {length} declared bytes");
        }

        Ok(Urb {
            id,
            kind,
            xfer_type,
            epnum,
            devnum,
            busnum,
            flag_setup,
            flag_data,
            ts_sec,
            ts_usec,
            status,
            length,
            len_cap,
            extra,
            payload,
        })
    }
}

mod libc_eintr {
    pub const EINPROGRESS: i32 = 115;
}

/// How an Interrupt URB rendered: acknowledgement (zero-length following
/// another same-direction interrupt), no data at all, a decoded report, or
/// an unrecognized payload.
#[derive(Debug, Clone)]
pub enum InterruptRender {
    Acknowledge { direction: Direction },
    NoData { direction: Direction },
    Report(String),
    Unknown { direction: Direction, hex: String },
}

impl fmt::Display for InterruptRender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterruptRender::Acknowledge { direction } => write!(f, "Interrupt {direction:?} Acknowledge"),
            InterruptRender::NoData { direction } => write!(f, "Interrupt {direction:?} No Data"),
            InterruptRender::Report(s) => write!(f, "{s}"),
            InterruptRender::Unknown { direction, hex } => write!(f, "Interrupt {direction:?} Unknown\n{hex}"),
        }
    }
}

/// Everything the reconstructor learns about one USB device: its descriptor
/// tree plus whatever's needed to render interrupt traffic against it.
#[derive(Debug, Clone)]
pub struct TrackedDevice {
    pub device: Device,
}

/// Owns the device map and the minimal back-reference state needed to pair
/// a Control Complete with its Submit. No process-wide singleton: callers
/// construct one per capture (or per `set_state` replay).
pub struct UsbContext {
    devices: Vec<TrackedDevice>,
    dev_map: BTreeMap<DevKey, usize>,
    prev: Option<Urb>,
    state_urbs: Vec<Vec<u8>>,
    start_ts: Option<(i64, i32)>,
    verbose: bool,
}

impl UsbContext {
    pub fn new(verbose: bool) -> UsbContext {
        UsbContext {
            devices: Vec::new(),
            dev_map: BTreeMap::new(),
            prev: None,
            state_urbs: Vec::new(),
            start_ts: None,
            verbose,
        }
    }

    fn device_mut(&mut self, key: DevKey) -> Option<&mut TrackedDevice> {
        self.dev_map.get(&key).copied().map(move |idx| &mut self.devices[idx])
    }

    fn device(&self, key: DevKey) -> Option<&TrackedDevice> {
        self.dev_map.get(&key).map(|&idx| &self.devices[idx])
    }

    /// Offset, in (seconds, microseconds), of `urb` relative to the first
    /// URB ever parsed by this context.
    fn relative_ts(&mut self, urb: &Urb) -> (i64, i32) {
        let (start_sec, start_usec) = *self.start_ts.get_or_insert((urb.ts_sec, urb.ts_usec));
        let mut sec = urb.ts_sec - start_sec;
        let usec = if urb.ts_usec < start_usec {
            sec -= 1;
            1_000_000 - (start_usec - urb.ts_usec)
        } else {
            urb.ts_usec - start_usec
        };
        (sec, usec)
    }

    /// Parse and apply one raw URB record, updating the device map and
    /// returning the decoded URB, its relative timestamp, and its
    /// human-readable rendering.
    pub fn parse_urb(&mut self, data: &[u8]) -> Result<(Urb, i64, i32, String)> {
        let urb = Urb::parse(data)?;
        let (sec, usec) = self.relative_ts(&urb);
        let rendered = self.apply(&urb)?;
        self.prev = Some(urb.clone());
        Ok((urb, sec, usec, rendered))
    }

    fn apply(&mut self, urb: &Urb) -> Result<String> {
        let key = urb.dev_key();
        if urb.is_device_lost() {
            if let Some(idx) = self.dev_map.remove(&key) {
                let _ = idx;
            }
            self.state_urbs.retain(|raw| Urb::parse(raw).map(|u| u.dev_key() != key).unwrap_or(true));
            return Ok(format!("{}.{} Error device reported not found! Removing.", urb.busnum, urb.devnum));
        }
        if urb.is_error() {
            return Ok(format!("{}.{} Error status {}", urb.busnum, urb.devnum, urb.status));
        }

        match urb.xfer_type {
            TransferType::Control => self.apply_control(urb, key),
            TransferType::Interrupt => self.apply_interrupt(urb, key),
            _ => Ok(format!("{}.{} Unsupported transfer type", urb.busnum, urb.devnum)),
        }
    }

    fn apply_control(&mut self, urb: &Urb, key: DevKey) -> Result<String> {
        // Every non-error Control URB is state-relevant: a Submit carries the
        // setup its paired Complete needs to decode, so both must survive a
        // state snapshot/replay round trip, not just the ones this context
        // recognizes a handler for.
        self.state_urbs.push(self.last_urb_bytes(urb));

        if urb.has_setup() {
            return Ok(format!("{}.{} Setup Request", urb.busnum, urb.devnum));
        }
        let prev = match &self.prev {
            Some(p) if p.has_setup() => p.clone(),
            _ => return Ok(format!("{}.{} Unsupported control response", urb.busnum, urb.devnum)),
        };
        let setup = match prev.extra {
            Some(UrbExtra::Setup { bm_request_type, b_request, w_value, w_index, .. }) => {
                (bm_request_type, b_request, w_value, w_index)
            }
            _ => return Ok(format!("{}.{} Unsupported control response", urb.busnum, urb.devnum)),
        };
        let (bm_request_type, b_request, w_value, w_index) = setup;

        if (bm_request_type, b_request) == REQUEST_SET_CONFIGURATION {
            if let Some(tracked) = self.device_mut(key) {
                tracked.device.set_configuration((w_value & 0xFF) as u8);
            }
            return Ok(format!("{}.{} Set Configuration Response", urb.busnum, urb.devnum));
        }

        if (bm_request_type, b_request) != REQUEST_GET_DESCRIPTOR {
            return Ok(format!("{}.{} Unsupported control response", urb.busnum, urb.devnum));
        }
        if urb.payload.is_empty() {
            return Ok(format!("{}.{} Response with no data", urb.busnum, urb.devnum));
        }

        match UrbExtra::desc_type(w_value) {
            DESC_TYPE_DEVICE => {
                let new_dev = Device::parse(&urb.payload)?;
                let alias = self.devices.iter().position(|d| d.device.identity_eq(&new_dev));
                let idx = match alias {
                    Some(idx) => idx,
                    None => {
                        self.devices.push(TrackedDevice { device: new_dev.clone() });
                        self.devices.len() - 1
                    }
                };
                self.dev_map.insert(key, idx);
                Ok(format!(
                    "{}.{} Vendor: {:04X} Product: {:04X}",
                    urb.busnum, urb.devnum, new_dev.vendor, new_dev.product
                ))
            }
            DESC_TYPE_CONFIGURATION => {
                let new_config = crate::descriptor::Configuration::parse(&urb.payload)?;
                if let Some(tracked) = self.device_mut(key) {
                    tracked.device.add_configuration(new_config);
                }
                Ok(format!("{}.{} Configuration Response", urb.busnum, urb.devnum))
            }
            DESC_TYPE_STRING => {
                let index = UrbExtra::desc_index(w_value);
                if index == 0 {
                    Ok(format!("{}.{} String Languages Record", urb.busnum, urb.devnum))
                } else {
                    let text = decode_string_desc(&urb.payload);
                    if let Some(tracked) = self.device_mut(key) {
                        tracked.device.set_string(index, &text);
                    }
                    Ok(format!("{}.{} String Response: \"{text}\"", urb.busnum, urb.devnum))
                }
            }
            _ => {
                // HID report descriptor: interface index is w_index's low byte.
                let interface = (w_index & 0xFF) as u8;
                if let Some(tracked) = self.device_mut(key) {
                    if let Some(config) = tracked.device.active_config_mut() {
                        if let Some(iface) = config.interfaces.get_mut(&interface) {
                            iface.set_hid_report(&urb.payload)?;
                        }
                    }
                }
                Ok(format!("{}.{} HID Report Response", urb.busnum, urb.devnum))
            }
        }
    }

    fn apply_interrupt(&mut self, urb: &Urb, key: DevKey) -> Result<String> {
        let direction = urb.direction();
        if urb.payload.is_empty() {
            let same_direction_prev = self
                .prev
                .as_ref()
                .is_some_and(|p| p.xfer_type == TransferType::Interrupt && p.direction() == direction);
            let render = if same_direction_prev {
                InterruptRender::Acknowledge { direction }
            } else {
                InterruptRender::NoData { direction }
            };
            return Ok(render.to_string());
        }

        let report_id = urb.payload[0];
        let payload = &urb.payload[1..];
        let tree = self
            .device(key)
            .and_then(|d| d.device.active_config())
            .and_then(|c| c.interfaces.values().find_map(|i| i.hid_tree()));

        let render = match tree {
            Some(tree) => match report::decode_interrupt(&tree, report_id, direction, payload) {
                Ok(s) => InterruptRender::Report(s),
                Err(_) => InterruptRender::Unknown { direction, hex: crate::hexdump::hexdump(&urb.payload) },
            },
            None => InterruptRender::Unknown { direction, hex: crate::hexdump::hexdump(&urb.payload) },
        };
        Ok(render.to_string())
    }

    fn last_urb_bytes(&self, urb: &Urb) -> Vec<u8> {
        // State-relevant URBs are replayed through parse_urb in set_state; we
        // keep the original bytes, including the fixed header, so replay
        // sees the same record it saw live.
        let mut bytes = Vec::with_capacity(URB_FIXED_LEN + urb.payload.len());
        bytes.extend_from_slice(&urb.id.to_le_bytes());
        bytes.push(match urb.kind {
            UrbKind::Submit => URB_TYPE_SUBMIT,
            UrbKind::Complete => URB_TYPE_COMPLETE,
        });
        bytes.push(match urb.xfer_type {
            TransferType::Iso => XFER_TYPE_ISO,
            TransferType::Interrupt => XFER_TYPE_INTERRUPT,
            TransferType::Control => XFER_TYPE_CONTROL,
            TransferType::Bulk => XFER_TYPE_BULK,
        });
        bytes.push(urb.epnum);
        bytes.push(urb.devnum);
        bytes.extend_from_slice(&urb.busnum.to_le_bytes());
        bytes.push(urb.flag_setup);
        bytes.push(urb.flag_data);
        bytes.extend_from_slice(&urb.ts_sec.to_le_bytes());
        bytes.extend_from_slice(&urb.ts_usec.to_le_bytes());
        bytes.extend_from_slice(&urb.status.to_le_bytes());
        bytes.extend_from_slice(&urb.length.to_le_bytes());
        bytes.extend_from_slice(&urb.len_cap.to_le_bytes());
        let mut union = [0u8; UNION_LEN];
        match urb.extra {
            Some(UrbExtra::Setup { bm_request_type, b_request, w_value, w_index, w_length }) => {
                union[0] = bm_request_type;
                union[1] = b_request;
                union[2..4].copy_from_slice(&w_value.to_le_bytes());
                union[4..6].copy_from_slice(&w_index.to_le_bytes());
                union[6..8].copy_from_slice(&w_length.to_le_bytes());
            }
            Some(UrbExtra::Iso { error_count, numdesc }) => {
                union[0..4].copy_from_slice(&error_count.to_le_bytes());
                union[4..8].copy_from_slice(&numdesc.to_le_bytes());
            }
            None => {}
        }
        bytes.extend_from_slice(&union);
        bytes.resize(bytes.len() + TAIL_LEN, 0);
        bytes.extend_from_slice(&urb.payload);
        bytes
    }

    /// Raw bytes of every URB marked as state-relevant (successful control
    /// responses that mutated a device). Feed these to [`set_state`] to
    /// rebuild the device map for a capture that starts mid-session.
    pub fn get_state(&self) -> &[Vec<u8>] {
        &self.state_urbs
    }

    pub fn set_state(&mut self, saved: &[Vec<u8>]) -> Result<()> {
        for raw in saved {
            self.parse_urb(raw)?;
        }
        self.start_ts = None;
        Ok(())
    }
}

fn decode_string_desc(data: &[u8]) -> String {
    if data.len() < 2 {
        return String::new();
    }
    let units: Vec<u16> = data[2..].chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
    String::from_utf16_lossy(&units)
}

/// Collapses runs of repeated rendered lines: tracks the last `lookbehind`
/// lines, and once the same line has repeated at least `min_run` times in a
/// row, suppresses further repeats until a different line arrives, at which
/// point it emits a summary instead of the suppressed lines.
pub struct DedupEmitter {
    lookbehind: usize,
    min_run: usize,
    last_line: Option<String>,
    run_len: usize,
    suppressed: usize,
}

impl DedupEmitter {
    pub fn new() -> DedupEmitter {
        DedupEmitter { lookbehind: 10, min_run: 2, last_line: None, run_len: 0, suppressed: 0 }
    }

    /// Feed the next rendered line; returns what to print, if anything.
    pub fn push(&mut self, line: &str) -> Option<String> {
        if self.last_line.as_deref() == Some(line) {
            self.run_len += 1;
            if self.run_len > self.min_run.min(self.lookbehind) {
                self.suppressed += 1;
                return None;
            }
            return Some(line.to_string());
        }
        let summary = if self.suppressed > 0 {
            Some(format!("(After {} duplicate patterns, last size {})", self.suppressed, self.run_len))
        } else {
            None
        };
        self.last_line = Some(line.to_string());
        self.run_len = 1;
        self.suppressed = 0;
        match summary {
            Some(s) => Some(format!("{s}\n{line}")),
            None => Some(line.to_string()),
        }
    }
}

impl Default for DedupEmitter {
    fn default() -> DedupEmitter {
        DedupEmitter::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urb_bytes(kind: u8, xfer_type: u8, epnum: u8, devnum: u8, busnum: u16, status: i32, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; URB_FIXED_LEN];
        buf[0..8].copy_from_slice(&1u64.to_le_bytes());
        buf[8] = kind;
        buf[9] = xfer_type;
        buf[10] = epnum;
        buf[11] = devnum;
        buf[12..14].copy_from_slice(&busnum.to_le_bytes());
        buf[14] = 1; // flag_setup: no setup
        buf[15] = if payload.is_empty() { 0 } else { FLAG_DATA_PRESENT };
        buf[28..32].copy_from_slice(&status.to_le_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn parses_minimal_interrupt_urb() {
        let data = urb_bytes(URB_TYPE_SUBMIT, XFER_TYPE_INTERRUPT, 0x81, 3, 1, 0, &[0x54, 0x01, 0x02]);
        let urb = Urb::parse(&data).unwrap();
        assert_eq!(urb.direction(), Direction::In);
        assert_eq!(urb.endpoint(), 1);
        assert_eq!(urb.payload, vec![0x54, 0x01, 0x02]);
    }

    #[test]
    fn device_lost_removes_dev_map_entry() {
        let mut ctx = UsbContext::new(false);
        let data = urb_bytes(URB_TYPE_COMPLETE, XFER_TYPE_CONTROL, 0x80, 5, 1, ENOENT, &[]);
        let (urb, ..) = ctx.parse_urb(&data).unwrap();
        assert!(urb.is_device_lost());
        assert!(ctx.device(DevKey { busnum: 1, devnum: 5 }).is_none());
    }

    #[test]
    fn empty_interrupt_after_same_direction_is_acknowledge() {
        let mut ctx = UsbContext::new(false);
        let first = urb_bytes(URB_TYPE_SUBMIT, XFER_TYPE_INTERRUPT, 0x81, 3, 1, 0, &[0x54, 0x00]);
        ctx.parse_urb(&first).unwrap();
        let second = urb_bytes(URB_TYPE_SUBMIT, XFER_TYPE_INTERRUPT, 0x81, 3, 1, 0, &[]);
        let (_, _, _, rendered) = ctx.parse_urb(&second).unwrap();
        assert!(rendered.contains("Acknowledge"));
    }

    #[test]
    fn dedup_emitter_collapses_repeats() {
        let mut dedup = DedupEmitter::new();
        assert_eq!(dedup.push("a").as_deref(), Some("a"));
        assert_eq!(dedup.push("a").as_deref(), Some("a"));
        assert_eq!(dedup.push("a"), None);
        assert_eq!(dedup.push("a"), None);
        let next = dedup.push("b").unwrap();
        assert!(next.contains("duplicate patterns"));
        assert!(next.ends_with('b'));
    }
}
