use thiserror::Error;

/// Every error this crate can surface, from the descriptor parser down to the
/// protocol engine. The CLI boundary maps each variant to a non-zero exit
/// code; nothing below this type is allowed to panic on attacker- or
/// device-controlled input.
#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed descriptor: {0}")]
    MalformedDescriptor(String),

    #[error("unsupported interface class {class:#04x} on interface {interface}")]
    UnsupportedInterfaceClass { interface: u8, class: u8 },

    #[error("unsupported key mapping type {0:#04x}")]
    UnsupportedMappingType(u8),

    #[error("report id {report_id} not present for direction {direction:?}; valid ids: {valid:?}")]
    BadReportId {
        report_id: u8,
        direction: crate::hid_tree::Direction,
        valid: Vec<u8>,
    },

    #[error("name cannot be encoded within {max_bytes} bytes")]
    NameUnencodable { max_bytes: usize },

    #[error("macro chunk out of order: expected pos {expected}, got {got}")]
    BadMacroChunkOrder { expected: u16, got: u16 },

    #[error("device responded without success marker: {0:02X?}")]
    DeviceNonSuccess(Vec<u8>),

    #[error("timed out waiting for device response")]
    Timeout,

    #[error("no raw-HID device found for vendor {vendor:#06x} product {product:#06x} interface {interface}")]
    DeviceMissing {
        vendor: u16,
        product: u16,
        interface: u8,
    },

    #[error("capture record truncated: {captured} of {declared} bytes")]
    CaptureTruncated { captured: u32, declared: u32 },

    #[error("no such key: {0}")]
    UnknownKeyName(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("device enumeration error: {0}")]
    Udev(String),
}

pub type Result<T> = std::result::Result<T, Error>;
