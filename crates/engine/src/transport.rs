//! Device handle contract
//!
//! The engine never talks to USB directly. It hands [`TransferSlot`]s to a
//! [`Transport`], which moves the bytes and later gives the slot back through
//! the completion handler supplied at submission time.

use crate::slot::TransferSlot;
use thiserror::Error;

/// Bit 7 of an endpoint address marks an IN (device to host) endpoint.
pub const ENDPOINT_DIR_IN: u8 = 0x80;

/// Callback run by the transport when a submitted transfer finishes.
///
/// Runs in the transport's completion context: it must not block or sleep.
pub type CompletionHandler = Box<dyn FnOnce(TransferSlot) + Send + 'static>;

/// Transfer direction, derived from the endpoint address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

impl Direction {
    /// Direction encoded in an endpoint address
    pub fn of(endpoint: u8) -> Self {
        if endpoint & ENDPOINT_DIR_IN != 0 {
            Self::In
        } else {
            Self::Out
        }
    }
}

/// Bulk endpoints resolved at attach time.
///
/// Immutable for the lifetime of an engine session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Endpoints {
    /// Bulk IN endpoint address (e.g. 0x81)
    pub inbound: Option<u8>,
    /// Bulk OUT endpoint address (e.g. 0x02)
    pub outbound: Option<u8>,
}

impl Endpoints {
    pub fn new(inbound: u8, outbound: u8) -> Self {
        Self {
            inbound: Some(inbound),
            outbound: Some(outbound),
        }
    }
}

/// Transfer failure codes, modelled on libusb status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum TransferError {
    #[error("transfer cancelled")]
    Cancelled,

    #[error("device disconnected")]
    NoDevice,

    #[error("device shutting down")]
    Shutdown,

    #[error("endpoint stalled")]
    Pipe,

    #[error("transfer timed out")]
    Timeout,

    #[error("device sent more data than requested")]
    Overflow,

    #[error("input/output error")]
    Io,

    #[error("resource busy")]
    Busy,

    #[error("invalid parameter")]
    InvalidParam,

    #[error("insufficient memory")]
    NoMem,

    #[error("transport error code {0}")]
    Other(i32),
}

impl TransferError {
    /// True for the "device departed" class: the endpoint will never complete
    /// another transfer in this session, so retrying is pointless.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::NoDevice | Self::Shutdown)
    }
}

/// Synchronous submission failure. The transport hands the slot back.
#[derive(Debug)]
pub struct SubmitError {
    pub slot: TransferSlot,
    pub error: TransferError,
}

/// Asynchronous transfer backend for one attached device.
pub trait Transport: Send + Sync {
    /// Queue `slot` for transfer and return immediately.
    ///
    /// On `Ok` the transport owns the slot and calls `on_complete` exactly once,
    /// with the outcome filled in. The handler must not be run from inside
    /// `submit` itself. On `Err` the handler is dropped uncalled.
    fn submit(
        &self,
        slot: TransferSlot,
        on_complete: CompletionHandler,
    ) -> Result<(), SubmitError>;

    /// Cancel every transfer outstanding on `endpoint` and block until each
    /// one's completion handler has returned. Idempotent.
    fn cancel(&self, endpoint: u8);
}
