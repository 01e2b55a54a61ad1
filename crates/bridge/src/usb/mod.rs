//! USB side of the bridge
//!
//! - `device`: find the adapter, claim its data interface, resolve bulk endpoints
//! - `transport`: blocking rusb bulk I/O behind the engine's `Transport` trait

pub mod device;
pub mod transport;

pub use device::{RadioDevice, list_devices};
pub use transport::UsbTransport;
