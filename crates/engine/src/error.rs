//! Engine error types
//!
//! Only session setup can fail in a caller-visible way. Once running, transport
//! errors are absorbed by the engine and surface through statistics and the
//! receive loop state.

use crate::transport::{Direction, TransferError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid engine configuration: {0}")]
    Config(String),

    #[error("no bulk {0:?} endpoint")]
    MissingEndpoint(Direction),

    #[error("endpoint {endpoint:#04x} is not an {expected:?} endpoint")]
    InvalidEndpoint { endpoint: u8, expected: Direction },

    #[error("failed to submit initial transfer: {0}")]
    Submit(#[from] TransferError),

    #[error("failed to allocate transfer slot: {0}")]
    Slot(#[from] crate::slot::SlotError),

    #[error("failed to spawn worker thread: {0}")]
    Worker(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
