//! HID device transport (C6): owns one raw-HID handle, materializes the
//! report index from the device's (or a cached) HID report descriptor, and
//! runs the cooperative `listen` loop the protocol engine drives.

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::time::Duration;

use nix::libc;
use nix::poll::{poll, PollFd, PollFlags};

use crate::error::{Error, Result};
use crate::hid_tree::{decode_report_descriptor, Direction, ReportTree};
use crate::report;

const HID_MAX_DESCRIPTOR_SIZE: usize = 4096;

#[repr(C)]
struct HidrawReportDescriptor {
    size: u32,
    value: [u8; HID_MAX_DESCRIPTOR_SIZE],
}

nix::ioctl_read!(hidiocgdescsize, b'H', 0x01, libc::c_int);
nix::ioctl_read!(hidiocgrdesc, b'H', 0x02, HidrawReportDescriptor);

fn cache_path(vendor: u16, product: u16, interface: u8) -> PathBuf {
    PathBuf::from(format!("{vendor:04x}_{product:04x}_{interface}.bin"))
}

fn read_descriptor_from_device(fd: RawFd) -> Result<Vec<u8>> {
    let mut size: libc::c_int = 0;
    unsafe { hidiocgdescsize(fd, &mut size) }.map_err(|e| Error::Io(std::io::Error::from(e)))?;
    let mut raw = HidrawReportDescriptor { size: size as u32, value: [0u8; HID_MAX_DESCRIPTOR_SIZE] };
    unsafe { hidiocgrdesc(fd, &mut raw) }.map_err(|e| Error::Io(std::io::Error::from(e)))?;
    Ok(raw.value[..size as usize].to_vec())
}

/// Locate the `hidraw` character device node for `(vendor, product,
/// interface)` by walking each candidate's parent chain: hidraw ->
/// hid-generic -> usb_interface -> usb_device.
fn find_hidraw_node(vendor: u16, product: u16, interface: u8) -> Result<PathBuf> {
    let mut enumerator = udev::Enumerator::new().map_err(|e| Error::Udev(e.to_string()))?;
    enumerator.match_subsystem("hidraw").map_err(|e| Error::Udev(e.to_string()))?;

    let want_vendor = format!("{vendor:04x}");
    let want_product = format!("{product:04x}");

    for device in enumerator.scan_devices().map_err(|e| Error::Udev(e.to_string()))? {
        let usb_device = device.parent().and_then(|p| p.parent()).and_then(|p| p.parent());
        let Some(usb_device) = usb_device else { continue };

        let vendor_ok = usb_device
            .property_value("ID_VENDOR_ID")
            .map(|v| v.to_string_lossy() == want_vendor)
            .unwrap_or(false);
        let product_ok = usb_device
            .property_value("ID_MODEL_ID")
            .map(|v| v.to_string_lossy() == want_product)
            .unwrap_or(false);
        if !vendor_ok || !product_ok {
            continue;
        }

        let usb_interface = device.parent().and_then(|p| p.parent());
        let Some(usb_interface) = usb_interface else { continue };
        let Some(devpath) = usb_interface.property_value("DEVPATH") else { continue };
        let devpath = devpath.to_string_lossy();
        let Some(dot) = devpath.rfind('.') else { continue };
        let Ok(iface_num) = devpath[dot + 1..].parse::<u8>() else { continue };
        if iface_num != interface {
            continue;
        }

        if let Some(node) = device.devnode() {
            return Ok(node.to_path_buf());
        }
    }

    Err(Error::DeviceMissing { vendor, product, interface })
}

/// One raw-HID handle, scoped to its lifetime: construction opens (or
/// caches) the report descriptor; the handle closes with the value.
pub struct HidTransport {
    file: std::fs::File,
    vendor: u16,
    product: u16,
    interface: u8,
    tree: ReportTree,
    read_buf_len: usize,
}

impl HidTransport {
    /// Open the device matching `(vendor, product, interface)`. `use_cache`
    /// prefers a previously saved `<vendor>_<product>_<interface>.bin`
    /// descriptor file over re-reading it from the device.
    pub fn open(vendor: u16, product: u16, interface: u8, use_cache: bool) -> Result<HidTransport> {
        let node = find_hidraw_node(vendor, product, interface)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&node)?;

        let path = cache_path(vendor, product, interface);
        let descriptor_bytes = if use_cache {
            match std::fs::read(&path) {
                Ok(bytes) => bytes,
                Err(_) => {
                    let bytes = read_descriptor_from_device(file.as_raw_fd())?;
                    std::fs::write(&path, &bytes)?;
                    bytes
                }
            }
        } else {
            let bytes = read_descriptor_from_device(file.as_raw_fd())?;
            std::fs::write(&path, &bytes)?;
            bytes
        };

        let root = decode_report_descriptor(&descriptor_bytes)?;
        let tree = ReportTree { root };
        let read_buf_len = largest_report_bytes(&tree) + 1;

        Ok(HidTransport { file, vendor, product, interface, tree, read_buf_len })
    }

    pub fn vendor(&self) -> u16 {
        self.vendor
    }

    pub fn product(&self) -> u16 {
        self.product
    }

    pub fn interface(&self) -> u8 {
        self.interface
    }

    pub fn tree(&self) -> &ReportTree {
        &self.tree
    }

    pub fn generate_report(&self, report_id: u8, payload: &[u8]) -> Result<Vec<u8>> {
        report::generate_report(&self.tree, report_id, payload)
    }

    pub fn decode(&self, report_id: u8, payload: &[u8]) -> Result<String> {
        let direction = self.report_direction(report_id)?;
        report::decode_interrupt(&self.tree, report_id, direction, payload)
    }

    /// Which direction a report id is declared for, or `BadReportId` with
    /// every valid id across both directions.
    pub fn report_direction(&self, report_id: u8) -> Result<Direction> {
        let out_reports = self.tree.get_reports(Direction::Out);
        let in_reports = self.tree.get_reports(Direction::In);
        if out_reports.contains_key(&report_id) {
            return Ok(Direction::Out);
        }
        if in_reports.contains_key(&report_id) {
            return Ok(Direction::In);
        }
        let mut valid: Vec<u8> = out_reports.keys().chain(in_reports.keys()).copied().collect();
        valid.sort_unstable();
        valid.dedup();
        Err(Error::BadReportId { report_id, direction: Direction::Out, valid })
    }

    /// Synchronous write; the kernel enforces that `buf` matches the
    /// report's declared size.
    pub fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.file.write_all(buf)?;
        Ok(())
    }

    fn poll_readable(&self, timeout: Duration) -> bool {
        let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
        let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        matches!(poll(&mut fds, timeout_ms), Ok(n) if n > 0)
    }

    /// Cooperative receive loop. Invokes `callback(report_id, payload)` for
    /// each received report; a `false` return stops the loop. `count < 0`
    /// means unbounded; `count == 0` returns immediately. Returns `true` on
    /// a callback-requested stop, `false` on a per-iteration timeout
    /// (cancellation is expressed by having the callback check its own flag
    /// and return `false`).
    pub fn listen<F>(&mut self, mut count: i64, timeout: Duration, mut callback: F) -> Result<bool>
    where
        F: FnMut(u8, &[u8]) -> bool,
    {
        while count != 0 {
            if !self.poll_readable(timeout) {
                return Ok(false);
            }
            let mut buf = vec![0u8; self.read_buf_len];
            let n = match self.file.read(&mut buf) {
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            };
            if n > 0 {
                let report_id = buf[0];
                if !callback(report_id, &buf[1..n]) {
                    return Ok(true);
                }
            }
            if count > 0 {
                count -= 1;
            }
        }
        Ok(true)
    }
}

fn largest_report_bytes(tree: &ReportTree) -> usize {
    let mut largest = 0usize;
    for direction in [Direction::Out, Direction::In] {
        for collection in tree.get_reports(direction).values() {
            let bytes = ((collection.total_bits() + 7) / 8) as usize;
            largest = largest.max(bytes);
        }
    }
    largest
}
