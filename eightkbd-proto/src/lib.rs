//! Protocol, descriptor, and capture-decoding primitives for the 8KBD split
//! keyboard's raw-HID vendor protocol.
//!
//! [`hid_tree`] and [`report`] decode and re-encode HID reports against a
//! parsed report descriptor; [`descriptor`] parses USB descriptors out of a
//! control-transfer capture; [`urb`] reconstructs device state from a stream
//! of `usbmon` URBs; [`profile`] and [`protocol`] implement the vendor
//! command set that reads and edits a keyboard's key map and macros;
//! [`transport`] is the live raw-HID handle these are driven over.

pub mod bits;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod hexdump;
pub mod hid_tree;
pub mod keys;
pub mod names;
pub mod profile;
pub mod protocol;
pub mod report;
pub mod transport;
pub mod urb;

pub use error::{Error, Result};
