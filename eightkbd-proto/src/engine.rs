//! Keyboard protocol engine (C7): drives a [`HidTransport`] through the
//! GET_*/SET_* vendor command set, reassembling multi-packet responses and
//! waiting for success acknowledgements the way §5's serialized-request
//! model requires.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::hid_tree::Direction;
use crate::profile::{Edit, KeyMapping, Macro, Profile};
use crate::protocol::{self, IN_REPORT_ID, OUT_REPORT_ID};
use crate::transport::HidTransport;

/// This device: vendor 0x2DC8, product 0x5200, HID interface 2.
pub const VENDOR_ID: u16 = 0x2DC8;
pub const PRODUCT_ID: u16 = 0x5200;
pub const INTERFACE: u8 = 2;

pub struct KeyboardEngine<'t> {
    transport: &'t mut HidTransport,
    timeout: Duration,
    test_mode: bool,
}

impl<'t> KeyboardEngine<'t> {
    pub fn new(transport: &'t mut HidTransport, timeout: Duration, test_mode: bool) -> KeyboardEngine<'t> {
        KeyboardEngine { transport, timeout, test_mode }
    }

    fn packet_len(&self) -> Result<usize> {
        let reports = self.transport.tree().get_reports(Direction::Out);
        let collection = reports.get(&OUT_REPORT_ID).ok_or_else(|| Error::BadReportId {
            report_id: OUT_REPORT_ID,
            direction: Direction::Out,
            valid: reports.keys().copied().collect(),
        })?;
        Ok(((collection.total_bits() + 7) / 8) as usize)
    }

    fn send(&mut self, body: &[u8]) -> Result<()> {
        if self.test_mode {
            log::info!("test: {:02X?}", body);
            return Ok(());
        }
        let report = self.transport.generate_report(OUT_REPORT_ID, body)?;
        self.transport.write(&report)
    }

    /// Block for exactly one report on [`IN_REPORT_ID`], or `Timeout`.
    fn recv(&mut self) -> Result<Vec<u8>> {
        let mut received = None;
        let stopped = self.transport.listen(1, self.timeout, |report_id, payload| {
            if report_id == IN_REPORT_ID {
                received = Some(payload.to_vec());
                false
            } else {
                true
            }
        })?;
        if !stopped {
            return Err(Error::Timeout);
        }
        received.ok_or(Error::Timeout)
    }

    fn send_and_expect_success(&mut self, body: &[u8]) -> Result<()> {
        self.send(body)?;
        if self.test_mode {
            return Ok(());
        }
        let response = self.recv()?;
        if !protocol::check_success(&response) {
            return Err(Error::DeviceNonSuccess(response));
        }
        Ok(())
    }

    pub fn get_name(&mut self) -> Result<String> {
        let packet_len = self.packet_len()?;
        self.send(&protocol::encode_get_name(packet_len))?;
        let response = self.recv()?;
        protocol::decode_name_response(&response)
    }

    /// GET_KEYS: the list of `from_key` wire codes carrying a mapping.
    pub fn get_key_codes(&mut self) -> Result<Vec<u8>> {
        let packet_len = self.packet_len()?;
        self.send(&protocol::encode_get_keys(packet_len))?;
        let mut acc = protocol::ListAccumulator::new();
        while !acc.is_done() {
            let response = self.recv()?;
            acc.push(&response);
        }
        Ok(acc.key_list(2))
    }

    /// GET_MACROS: the list of `from_key` wire codes carrying a macro.
    pub fn get_macro_codes(&mut self) -> Result<Vec<u8>> {
        let packet_len = self.packet_len()?;
        self.send(&protocol::encode_get_macros(packet_len))?;
        let mut acc = protocol::ListAccumulator::new();
        while !acc.is_done() {
            let response = self.recv()?;
            acc.push(&response);
        }
        Ok(acc.key_list(2))
    }

    pub fn get_key(&mut self, from_key: u8) -> Result<(u8, KeyMapping)> {
        let packet_len = self.packet_len()?;
        self.send(&protocol::encode_get_key(from_key, packet_len))?;
        let response = self.recv()?;
        protocol::decode_key_response(&response)
    }

    pub fn get_macro_name(&mut self, from_key: u8) -> Result<String> {
        let packet_len = self.packet_len()?;
        self.send(&protocol::encode_get_macro_name(from_key, packet_len))?;
        let response = self.recv()?;
        protocol::decode_name_response(&response)
    }

    pub fn get_macro(&mut self, from_key: u8) -> Result<Macro> {
        let name = self.get_macro_name(from_key)?;
        let packet_len = self.packet_len()?;
        self.send(&protocol::encode_get_macro(from_key, packet_len))?;
        let mut acc = protocol::MacroAccumulator::new();
        while !acc.is_done() {
            let response = self.recv()?;
            acc.push(&response)?;
        }
        let mut macro_ = protocol::decode_macro_body(&acc.into_body())?;
        macro_.name = name;
        Ok(macro_)
    }

    /// Read the full on-device profile: name, every assignable key's
    /// mapping, and every declared macro's body.
    pub fn get_profile(&mut self, assignable_keys: &[u8]) -> Result<Profile> {
        let name = self.get_name()?;
        let mut profile = Profile { name, keys: Default::default(), macros: Default::default() };
        for &from_key in assignable_keys {
            if let Ok((key, mapping)) = self.get_key(from_key) {
                profile.keys.insert(key, mapping);
            }
        }
        for from_key in self.get_macro_codes()? {
            let macro_ = self.get_macro(from_key)?;
            profile.macros.insert(from_key, macro_);
        }
        Ok(profile)
    }

    /// Send one edit's packets, waiting for a success ack wherever the
    /// encoder tagged one.
    pub fn apply_edit(&mut self, edit: &Edit) -> Result<()> {
        let packet_len = self.packet_len()?;
        for (packet, wait) in protocol::encode_edit(edit, packet_len)? {
            if wait {
                self.send_and_expect_success(&packet)?;
            } else {
                self.send(&packet)?;
            }
        }
        Ok(())
    }

    /// Send every edit in `edits`, in order.
    pub fn submit(&mut self, edits: &[Edit]) -> Result<()> {
        for edit in edits {
            self.apply_edit(edit)?;
        }
        Ok(())
    }
}
