//! Interface statistics
//!
//! Counters mirror the usual network-device statistics. They live behind their
//! own lock, separate from the transmit queue lock, so the submission path and
//! the completion path can both update them without ordering against the queue.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Snapshot of the interface counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetStats {
    /// Packets handed to the transport successfully
    pub tx_packets: u64,
    /// Bytes handed to the transport successfully
    pub tx_bytes: u64,
    /// Failed submissions and failed TX completions
    pub tx_errors: u64,
    /// Packets discarded without reaching the device
    pub tx_dropped: u64,
    /// Packets delivered upward
    pub rx_packets: u64,
    /// Bytes delivered upward
    pub rx_bytes: u64,
    /// Failed RX completions and failed resubmissions
    pub rx_errors: u64,
    /// Received packets that could not be delivered
    pub rx_dropped: u64,
}

/// Lock-protected counters shared between the engine's execution contexts
#[derive(Debug, Default)]
pub struct Stats {
    inner: Mutex<NetStats>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `update` to the counters under the stats lock
    pub fn update(&self, update: impl FnOnce(&mut NetStats)) {
        update(&mut self.lock());
    }

    /// Copy of the current counters
    pub fn snapshot(&self) -> NetStats {
        *self.lock()
    }

    fn lock(&self) -> MutexGuard<'_, NetStats> {
        // Counters are plain integers: a panic mid-update cannot leave them torn
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
