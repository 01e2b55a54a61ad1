//! Transfer slots
//!
//! A [`TransferSlot`] is the bookkeeping record for one in-flight transfer:
//! endpoint, buffer, length, the packet it carries (TX only) and the outcome.
//! Ownership moves into the transport on submit and comes back through the
//! completion handler, so nothing else can touch the buffer while the transfer
//! is running.
//!
//! Every slot is accounted for in a [`SlotLedger`]. The ledger caps how many
//! slots may be alive at once and is decremented exactly once, when the slot is
//! dropped.

use crate::transport::{Direction, TransferError};
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use thiserror::Error;

/// Result of a transfer as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Armed or in flight; no result yet
    Pending,
    /// Finished; `actual_length` bytes were moved
    Completed { actual_length: usize },
    /// Finished with an error
    Failed(TransferError),
}

/// Slot allocation failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SlotError {
    #[error("slot limit reached ({limit} live slots)")]
    Exhausted { limit: usize },

    #[error("failed to allocate {size} byte transfer buffer")]
    Alloc { size: usize },
}

/// Live-slot accounting shared by every slot of one engine session
#[derive(Debug)]
pub struct SlotLedger {
    live: AtomicUsize,
    limit: usize,
    next_id: AtomicU64,
}

impl SlotLedger {
    /// Create a ledger allowing at most `limit` live slots
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            live: AtomicUsize::new(0),
            limit,
            next_id: AtomicU64::new(1),
        })
    }

    /// Number of slots currently alive
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Number of slots ever allocated
    pub fn allocated(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed) - 1
    }

    fn reserve(&self) -> Result<u64, SlotError> {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < self.limit).then_some(live + 1)
            })
            .map_err(|_| SlotError::Exhausted { limit: self.limit })?;

        Ok(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn release(&self) {
        let previous = self.live.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "slot released twice");
    }
}

/// Allocate a zeroed buffer without aborting on allocation failure
fn try_alloc(size: usize) -> Result<Vec<u8>, SlotError> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(size)
        .map_err(|_| SlotError::Alloc { size })?;
    Ok(buffer)
}

/// One unit of in-flight transfer state
pub struct TransferSlot {
    id: u64,
    endpoint: u8,
    buffer: Vec<u8>,
    length: usize,
    packet: Option<Bytes>,
    outcome: TransferOutcome,
    ledger: Arc<SlotLedger>,
}

impl TransferSlot {
    /// Arm a slot that sends `packet` to an OUT endpoint.
    ///
    /// The packet bytes are copied into a buffer owned by the slot; the packet
    /// handle itself is retained until the slot is released.
    pub fn outbound(
        ledger: &Arc<SlotLedger>,
        endpoint: u8,
        packet: Bytes,
    ) -> Result<Self, SlotError> {
        let mut buffer = try_alloc(packet.len())?;
        let id = ledger.reserve()?;
        buffer.extend_from_slice(&packet);

        Ok(Self {
            id,
            endpoint,
            length: buffer.len(),
            buffer,
            packet: Some(packet),
            outcome: TransferOutcome::Pending,
            ledger: Arc::clone(ledger),
        })
    }

    /// Arm a slot that reads up to `capacity` bytes from an IN endpoint
    pub fn inbound(
        ledger: &Arc<SlotLedger>,
        endpoint: u8,
        capacity: usize,
    ) -> Result<Self, SlotError> {
        let mut buffer = try_alloc(capacity)?;
        let id = ledger.reserve()?;
        buffer.resize(capacity, 0);

        Ok(Self {
            id,
            endpoint,
            buffer,
            length: capacity,
            packet: None,
            outcome: TransferOutcome::Pending,
            ledger: Arc::clone(ledger),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }

    pub fn direction(&self) -> Direction {
        Direction::of(self.endpoint)
    }

    /// Requested transfer length in bytes
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn outcome(&self) -> TransferOutcome {
        self.outcome
    }

    /// Bytes to send (OUT) or the whole receive area (IN)
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.length]
    }

    /// Receive area the transport writes into
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[..self.length]
    }

    /// Bytes actually received by a completed IN transfer
    pub fn received(&self) -> &[u8] {
        match self.outcome {
            TransferOutcome::Completed { actual_length } => &self.buffer[..actual_length],
            _ => &[],
        }
    }

    /// The packet this slot carries, if any
    pub fn packet(&self) -> Option<&Bytes> {
        self.packet.as_ref()
    }

    /// Record a successful completion. Called by the transport.
    pub fn complete(&mut self, actual_length: usize) {
        self.outcome = TransferOutcome::Completed {
            actual_length: actual_length.min(self.length),
        };
    }

    /// Record a failed completion. Called by the transport.
    pub fn fail(&mut self, error: TransferError) {
        self.outcome = TransferOutcome::Failed(error);
    }

    /// Reset a persistent slot for resubmission
    pub fn rearm(&mut self) {
        self.outcome = TransferOutcome::Pending;
    }
}

impl Drop for TransferSlot {
    fn drop(&mut self) {
        self.ledger.release();
    }
}

impl fmt::Debug for TransferSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferSlot")
            .field("id", &self.id)
            .field("endpoint", &format_args!("{:#04x}", self.endpoint))
            .field("length", &self.length)
            .field("has_packet", &self.packet.is_some())
            .field("outcome", &self.outcome)
            .finish()
    }
}
