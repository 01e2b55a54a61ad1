//! Asynchronous bulk-transfer engine for USB network adapters
//!
//! Moves packets between a host network stack and a device's bulk endpoints:
//! - a transmit queue drained by a dedicated worker, one transfer in flight
//! - a persistent receive loop that re-arms after every completion
//! - watermark backpressure towards the packet source
//! - ordered shutdown that waits for every outstanding transfer
//!
//! The device itself sits behind the [`Transport`] trait; the host side
//! behind [`UpboundSink`] and [`CongestionSignal`].

pub mod config;
pub mod error;
pub mod gate;
pub mod queue;
pub mod rx;
pub mod session;
pub mod sink;
pub mod slot;
pub mod stats;
pub mod test_utils;
pub mod transport;
mod tx;

pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use queue::{EnqueueStatus, RejectReason};
pub use rx::{RxState, StopReason};
pub use session::{Engine, EngineStatus};
pub use sink::{CongestionSignal, IgnoreCongestion, RxMeta, UpboundSink};
pub use slot::{SlotError, SlotLedger, TransferOutcome, TransferSlot};
pub use stats::NetStats;
pub use transport::{
    CompletionHandler, Direction, Endpoints, SubmitError, TransferError, Transport,
};
