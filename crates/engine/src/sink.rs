//! Upper-layer collaborators
//!
//! Both traits are called from the transport's completion context (and the
//! congestion signal also from `enqueue` and the worker), so implementations
//! must return quickly and must never block.

use bytes::Bytes;

/// Metadata attached to every packet delivered upward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxMeta {
    /// Per-session delivery sequence number, starting at 0
    pub sequence: u64,
    /// Endpoint the packet arrived on
    pub endpoint: u8,
    /// Wall-clock receive time in microseconds since the Unix epoch
    pub timestamp_us: u64,
}

/// Receiver of inbound packets (the host network stack)
pub trait UpboundSink: Send + Sync {
    /// Hand a received packet upward. Fire and forget.
    fn deliver(&self, packet: Bytes, meta: RxMeta);
}

/// Flow-control notifications to the owner of the packet source.
///
/// Called while the engine holds its queue lock: implementations must not
/// call back into the engine.
pub trait CongestionSignal: Send + Sync {
    /// Stop offering packets
    fn pause(&self);

    /// Resume offering packets
    fn resume(&self);
}

/// Congestion signal for callers that do not do flow control
#[derive(Debug, Default, Clone, Copy)]
pub struct IgnoreCongestion;

impl CongestionSignal for IgnoreCongestion {
    fn pause(&self) {}

    fn resume(&self) {}
}
