//! USB descriptor chain parser (C2): Device, Configuration, Interface,
//! Endpoint and HID descriptors out of a contiguous GET_DESCRIPTOR payload.

use crate::error::{Error, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::collections::BTreeMap;

pub const DESC_TYPE_DEVICE: u8 = 1;
pub const DESC_TYPE_CONFIGURATION: u8 = 2;
pub const DESC_TYPE_STRING: u8 = 3;
pub const DESC_TYPE_INTERFACE: u8 = 4;
pub const DESC_TYPE_ENDPOINT: u8 = 5;
pub const DESC_TYPE_HID: u8 = 0x21;

pub const CLASS_HID: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HidDescriptor {
    pub hid_version: u16,
    pub country_code: u8,
    pub num_descriptors: u8,
    pub descriptor_type: u8,
    pub descriptor_length: u16,
    pub report_tree: Option<crate::hid_tree::Collection>,
}

pub const HID_DESC_SIZE: usize = 9;

fn parse_hid_descriptor(buf: &[u8]) -> Result<HidDescriptor> {
    if buf.len() < HID_DESC_SIZE {
        return Err(Error::MalformedDescriptor("short HID descriptor".into()));
    }
    // buf[0]=bLength, buf[1]=bDescriptorType
    Ok(HidDescriptor {
        hid_version: LittleEndian::read_u16(&buf[2..4]),
        country_code: buf[4],
        num_descriptors: buf[5],
        descriptor_type: buf[6],
        descriptor_length: LittleEndian::read_u16(&buf[7..9]),
        report_tree: None,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointAddress(pub u8);

impl EndpointAddress {
    pub fn number(self) -> u8 {
        self.0 & 0x0F
    }

    pub fn is_in(self) -> bool {
        self.0 & 0x80 != 0
    }

    pub fn direction(self) -> crate::hid_tree::Direction {
        if self.is_in() {
            crate::hid_tree::Direction::In
        } else {
            crate::hid_tree::Direction::Out
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub address: EndpointAddress,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

pub const ENDPOINT_DESC_SIZE: usize = 7;

impl Endpoint {
    fn parse(buf: &[u8]) -> Result<Endpoint> {
        if buf.len() < ENDPOINT_DESC_SIZE {
            return Err(Error::MalformedDescriptor("short endpoint descriptor".into()));
        }
        Ok(Endpoint {
            address: EndpointAddress(buf[2]),
            attributes: buf[3],
            max_packet_size: LittleEndian::read_u16(&buf[4..6]),
            interval: buf[6],
        })
    }

    pub fn kind(&self) -> EndpointKind {
        match self.attributes & 0x03 {
            0 => EndpointKind::Control,
            1 => EndpointKind::Isochronous,
            2 => EndpointKind::Bulk,
            _ => EndpointKind::Interrupt,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub interface_id: u8,
    pub alternate_setting: u8,
    pub interface_class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub string_index: u8,
    pub interface_string: Option<String>,
    pub endpoints: BTreeMap<u8, Endpoint>,
    pub hid: Option<HidDescriptor>,
}

pub const INTERFACE_DESC_SIZE: usize = 9;

impl Interface {
    /// Parse one Interface descriptor (and, for HID interfaces, its trailing
    /// HID descriptor and endpoint descriptors) starting at `buf[0]`.
    /// Returns the interface and the number of bytes consumed.
    fn parse(buf: &[u8]) -> Result<(Interface, usize)> {
        if buf.len() < INTERFACE_DESC_SIZE {
            return Err(Error::MalformedDescriptor("short interface descriptor".into()));
        }
        let interface_id = buf[2];
        let alternate_setting = buf[3];
        let num_endpoints = buf[4];
        let interface_class = buf[5];
        let subclass = buf[6];
        let protocol = buf[7];
        let string_index = buf[8];

        if interface_class != CLASS_HID {
            return Err(Error::UnsupportedInterfaceClass {
                interface: interface_id,
                class: interface_class,
            });
        }

        let mut pos = INTERFACE_DESC_SIZE;
        let hid = parse_hid_descriptor(&buf[pos..])?;
        pos += HID_DESC_SIZE;

        let mut endpoints = BTreeMap::new();
        for _ in 0..num_endpoints {
            let ep = Endpoint::parse(&buf[pos..])?;
            pos += ENDPOINT_DESC_SIZE;
            endpoints.insert(ep.address.number(), ep);
        }

        Ok((
            Interface {
                interface_id,
                alternate_setting,
                interface_class,
                subclass,
                protocol,
                string_index,
                interface_string: None,
                endpoints,
                hid: Some(hid),
            },
            pos,
        ))
    }

    /// Decode the HID report descriptor bytes for this interface.
    pub fn set_hid_report(&mut self, data: &[u8]) -> Result<()> {
        let tree = crate::hid_tree::decode_report_descriptor(data)?;
        if let Some(hid) = &mut self.hid {
            hid.report_tree = Some(tree);
        }
        Ok(())
    }

    fn set_string(&mut self, index: u8, value: &str) -> bool {
        if self.string_index == index {
            let used = accept_better_string(&mut self.interface_string, value);
            return used;
        }
        false
    }

    /// This interface's decoded HID report tree, if its HID report
    /// descriptor has been read yet.
    pub fn hid_tree(&self) -> Option<crate::hid_tree::ReportTree> {
        let root = self.hid.as_ref()?.report_tree.clone()?;
        Some(crate::hid_tree::ReportTree { root })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    pub total_length: u16,
    pub num_interfaces: u8,
    pub configuration_id: u8,
    pub string_index: u8,
    pub attributes: u8,
    pub max_power: u8,
    pub interfaces: BTreeMap<u8, Interface>,
    pub endpoint_to_interface: BTreeMap<u8, u8>,
    pub configuration_string: Option<String>,
}

pub const CONFIGURATION_DESC_SIZE: usize = 9;

pub const ATTRIB_SELF_POWERED: u8 = 0x40;
pub const ATTRIB_REMOTE_WAKEUP: u8 = 0x20;

impl Configuration {
    /// Parse a Configuration descriptor and, when the buffer is long enough
    /// to hold `total_length` bytes, its nested Interface/Endpoint/HID chain.
    pub fn parse(buf: &[u8]) -> Result<Configuration> {
        if buf.len() < CONFIGURATION_DESC_SIZE {
            return Err(Error::MalformedDescriptor("short configuration descriptor".into()));
        }
        let total_length = LittleEndian::read_u16(&buf[2..4]);
        let num_interfaces = buf[4];
        let configuration_id = buf[5];
        let string_index = buf[6];
        let attributes = buf[7];
        let max_power = buf[8];

        let mut interfaces = BTreeMap::new();
        let mut endpoint_to_interface = BTreeMap::new();

        if buf.len() as u16 >= total_length {
            let mut pos = CONFIGURATION_DESC_SIZE;
            for _ in 0..num_interfaces {
                let (interface, consumed) = Interface::parse(&buf[pos..])?;
                pos += consumed;
                for &ep_num in interface.endpoints.keys() {
                    endpoint_to_interface.insert(ep_num, interface.interface_id);
                }
                interfaces.insert(interface.interface_id, interface);
            }
        }
        // else: captured length shorter than total_length; accept the
        // configuration with an empty interface list, to be completed by a
        // later re-request of the full configuration descriptor.

        Ok(Configuration {
            total_length,
            num_interfaces,
            configuration_id,
            string_index,
            attributes,
            max_power,
            interfaces,
            endpoint_to_interface,
            configuration_string: None,
        })
    }

    pub fn is_complete(&self) -> bool {
        !self.interfaces.is_empty() || self.num_interfaces == 0
    }

    fn set_string(&mut self, index: u8, value: &str) -> bool {
        let mut found = accept_better_string(&mut self.configuration_string, value);
        for interface in self.interfaces.values_mut() {
            if interface.set_string(index, value) {
                found = true;
            }
        }
        found
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub usb_version: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub max_packet_size: u8,
    pub vendor: u16,
    pub product: u16,
    pub device_version: u16,
    pub manufacturer_string_id: u8,
    pub product_string_id: u8,
    pub serial_number_string_id: u8,
    pub num_configurations: u8,
    pub manufacturer_string: Option<String>,
    pub product_string: Option<String>,
    pub serial_number_string: Option<String>,
    pub configurations: BTreeMap<u8, Configuration>,
    pub active_configuration: Option<u8>,
}

pub const DEVICE_DESC_SIZE: usize = 18;

impl Device {
    pub fn parse(buf: &[u8]) -> Result<Device> {
        if buf.len() < DEVICE_DESC_SIZE {
            return Err(Error::MalformedDescriptor("short device descriptor".into()));
        }
        Ok(Device {
            usb_version: LittleEndian::read_u16(&buf[2..4]),
            device_class: buf[4],
            device_subclass: buf[5],
            device_protocol: buf[6],
            max_packet_size: buf[7],
            vendor: LittleEndian::read_u16(&buf[8..10]),
            product: LittleEndian::read_u16(&buf[10..12]),
            device_version: LittleEndian::read_u16(&buf[12..14]),
            manufacturer_string_id: buf[14],
            product_string_id: buf[15],
            serial_number_string_id: buf[16],
            num_configurations: buf[17],
            manufacturer_string: None,
            product_string: None,
            serial_number_string: None,
            configurations: BTreeMap::new(),
            active_configuration: None,
        })
    }

    /// Device equality used by the URB reconstructor for aliasing: vendor,
    /// product and device-version, deliberately ignoring serial numbers
    /// which are not always known in time.
    pub fn identity_eq(&self, other: &Device) -> bool {
        self.vendor == other.vendor
            && self.product == other.product
            && self.device_version == other.device_version
    }

    /// Insert `config`, unless an existing configuration with the same id
    /// already has a populated interface list.
    pub fn add_configuration(&mut self, config: Configuration) {
        let replace = match self.configurations.get(&config.configuration_id) {
            Some(existing) => existing.interfaces.is_empty(),
            None => true,
        };
        if replace {
            self.configurations.insert(config.configuration_id, config);
        }
    }

    pub fn set_configuration(&mut self, id: u8) {
        self.active_configuration = Some(id);
    }

    pub fn active_config(&self) -> Option<&Configuration> {
        self.active_configuration.and_then(|id| self.configurations.get(&id))
    }

    pub fn active_config_mut(&mut self) -> Option<&mut Configuration> {
        let id = self.active_configuration?;
        self.configurations.get_mut(&id)
    }

    /// Propagate a decoded string to every matching string index across the
    /// device and its configurations. Returns whether anything used it.
    pub fn set_string(&mut self, index: u8, value: &str) -> bool {
        let mut found = false;
        if self.manufacturer_string_id == index
            && accept_better_string(&mut self.manufacturer_string, value)
        {
            found = true;
        }
        if self.product_string_id == index && accept_better_string(&mut self.product_string, value)
        {
            found = true;
        }
        if self.serial_number_string_id == index
            && accept_better_string(&mut self.serial_number_string, value)
        {
            found = true;
        }
        for config in self.configurations.values_mut() {
            if config.set_string(index, value) {
                found = true;
            }
        }
        found
    }
}

/// Accept `candidate` into `slot` unless the existing value is a proper
/// superset (the new read is a truncated prefix of what we already have).
/// Returns whether the candidate was used.
fn accept_better_string(slot: &mut Option<String>, candidate: &str) -> bool {
    match slot {
        Some(existing) if existing.starts_with(candidate) && existing.len() > candidate.len() => {
            false
        }
        _ => {
            *slot = Some(candidate.to_string());
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_bytes(vendor: u16, product: u16) -> Vec<u8> {
        let mut buf = vec![0u8; DEVICE_DESC_SIZE];
        buf[0] = DEVICE_DESC_SIZE as u8;
        buf[1] = DESC_TYPE_DEVICE;
        LittleEndian::write_u16(&mut buf[2..4], 0x0200);
        buf[4] = 0; // class
        buf[5] = 0;
        buf[6] = 0;
        buf[7] = 64;
        LittleEndian::write_u16(&mut buf[8..10], vendor);
        LittleEndian::write_u16(&mut buf[10..12], product);
        LittleEndian::write_u16(&mut buf[12..14], 0x0100);
        buf[14] = 1;
        buf[15] = 2;
        buf[16] = 3;
        buf[17] = 1;
        buf
    }

    #[test]
    fn parses_device_descriptor() {
        let buf = device_bytes(0x2DC8, 0x5200);
        let device = Device::parse(&buf).unwrap();
        assert_eq!(device.vendor, 0x2DC8);
        assert_eq!(device.product, 0x5200);
        assert_eq!(device.num_configurations, 1);
    }

    #[test]
    fn identity_eq_ignores_serial() {
        let mut a = Device::parse(&device_bytes(0x2DC8, 0x5200)).unwrap();
        let b = Device::parse(&device_bytes(0x2DC8, 0x5200)).unwrap();
        a.serial_number_string = Some("one".into());
        assert!(a.identity_eq(&b));
    }

    #[test]
    fn truncated_configuration_has_empty_interfaces() {
        let mut buf = vec![0u8; CONFIGURATION_DESC_SIZE];
        buf[0] = CONFIGURATION_DESC_SIZE as u8;
        buf[1] = DESC_TYPE_CONFIGURATION;
        LittleEndian::write_u16(&mut buf[2..4], 100); // total_length claims more
        buf[4] = 1; // num_interfaces
        buf[5] = 1; // configuration_id
        let config = Configuration::parse(&buf).unwrap();
        assert!(config.interfaces.is_empty());
        assert!(!config.is_complete());
    }

    #[test]
    fn non_hid_interface_is_rejected() {
        let mut buf = vec![0u8; INTERFACE_DESC_SIZE];
        buf[0] = INTERFACE_DESC_SIZE as u8;
        buf[1] = DESC_TYPE_INTERFACE;
        buf[2] = 0; // interface_id
        buf[5] = 0x08; // mass storage class, not HID
        let err = Interface::parse(&buf).unwrap_err();
        assert!(matches!(err, Error::UnsupportedInterfaceClass { .. }));
    }

    #[test]
    fn string_truncation_is_rejected_in_favor_of_longer_read() {
        let mut slot = Some("hello world".to_string());
        let used = accept_better_string(&mut slot, "hello");
        assert!(!used);
        assert_eq!(slot.as_deref(), Some("hello world"));
    }
}
