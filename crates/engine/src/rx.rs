//! Receive loop
//!
//! A single persistent IN slot is submitted once at start. Each completion
//! copies the received bytes out, hands them upward and resubmits the same
//! slot. The loop ends when the device goes away, when too many consecutive
//! errors pile up, or when the session stops.
//!
//! The state lock serialises the completion handler against `stop`: a
//! completion that observes `Stopping` consumes the slot instead of
//! resubmitting it, and `stop` only cancels after publishing `Stopping`.

use crate::error::Result;
use crate::sink::{RxMeta, UpboundSink};
use crate::slot::{SlotLedger, TransferOutcome, TransferSlot};
use crate::stats::Stats;
use crate::transport::{SubmitError, TransferError, Transport};
use bytes::Bytes;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, trace, warn};

/// Lifecycle of the receive loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    /// Not started
    Idle,
    /// A receive transfer is outstanding
    Armed,
    /// Shutdown requested; the next completion ends the loop
    Stopping,
    /// Terminal; no receive transfer is outstanding
    Stopped(StopReason),
}

/// Why the receive loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The device disconnected or the transfer was cancelled underneath us
    DeviceGone,
    /// Consecutive errors exceeded the configured maximum
    TooManyErrors,
    /// The session was stopped
    Shutdown,
}

pub(crate) struct RxLoop {
    transport: Arc<dyn Transport>,
    endpoint: u8,
    buffer_size: usize,
    max_errors: u32,
    sink: Arc<dyn UpboundSink>,
    stats: Arc<Stats>,
    ledger: Arc<SlotLedger>,
    state: Mutex<RxState>,
    consecutive_errors: AtomicU32,
    sequence: AtomicU64,
    /// Builds the owned upward packet; `None` when allocation fails
    copy_out: fn(&[u8]) -> Option<Bytes>,
}

pub(crate) struct RxSettings {
    pub endpoint: u8,
    pub buffer_size: usize,
    pub max_errors: u32,
}

impl RxLoop {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        settings: RxSettings,
        sink: Arc<dyn UpboundSink>,
        stats: Arc<Stats>,
        ledger: Arc<SlotLedger>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            endpoint: settings.endpoint,
            buffer_size: settings.buffer_size,
            max_errors: settings.max_errors,
            sink,
            stats,
            ledger,
            state: Mutex::new(RxState::Idle),
            consecutive_errors: AtomicU32::new(0),
            sequence: AtomicU64::new(0),
            copy_out: copy_received,
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, RxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> RxState {
        *self.lock_state()
    }

    pub(crate) fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::Relaxed)
    }

    /// Allocate the persistent slot and submit it
    pub(crate) fn start(self: &Arc<Self>) -> Result<()> {
        let slot = TransferSlot::inbound(&self.ledger, self.endpoint, self.buffer_size)?;

        // Held across submit so a fast completion cannot run before Armed
        let mut state = self.lock_state();
        match self.submit(slot) {
            Ok(()) => {
                *state = RxState::Armed;
                info!(
                    "RX loop armed on endpoint {:#04x} ({} byte buffer)",
                    self.endpoint, self.buffer_size
                );
                Ok(())
            }
            Err(SubmitError { error, .. }) => {
                error!("Failed to submit initial RX transfer: {}", error);
                *state = RxState::Stopped(if error.is_fatal() {
                    StopReason::DeviceGone
                } else {
                    StopReason::TooManyErrors
                });
                Err(error.into())
            }
        }
    }

    /// End the loop and wait until the slot has been released
    pub(crate) fn stop(&self) {
        {
            let mut state = self.lock_state();
            match *state {
                RxState::Armed => *state = RxState::Stopping,
                RxState::Idle => {
                    *state = RxState::Stopped(StopReason::Shutdown);
                    return;
                }
                RxState::Stopping | RxState::Stopped(_) => return,
            }
        }

        debug!("Cancelling RX transfer on {:#04x}", self.endpoint);
        self.transport.cancel(self.endpoint);

        let mut state = self.lock_state();
        if *state == RxState::Stopping {
            // The transport had nothing outstanding to complete
            *state = RxState::Stopped(StopReason::Shutdown);
        }
    }

    fn submit(self: &Arc<Self>, slot: TransferSlot) -> std::result::Result<(), SubmitError> {
        let rx = Arc::clone(self);
        self.transport
            .submit(slot, Box::new(move |slot| rx.complete(slot)))
    }

    fn complete(self: &Arc<Self>, slot: TransferSlot) {
        let mut state = self.lock_state();

        if *state == RxState::Stopping {
            debug!("RX loop stopped, releasing slot {}", slot.id());
            *state = RxState::Stopped(StopReason::Shutdown);
            return;
        }

        let result = match slot.outcome() {
            TransferOutcome::Completed { actual_length } => Ok(actual_length),
            TransferOutcome::Failed(error) => Err(error),
            TransferOutcome::Pending => {
                error!("RX transfer {} completed without an outcome", slot.id());
                Err(TransferError::Io)
            }
        };

        match result {
            Ok(0) => {
                self.consecutive_errors.store(0, Ordering::Relaxed);
                trace!("Zero-length RX transfer");
            }
            Ok(_) => {
                self.consecutive_errors.store(0, Ordering::Relaxed);
                self.deliver(slot.received());
            }
            Err(error) if error.is_fatal() => {
                info!("RX transfer ended: {}", error);
                *state = RxState::Stopped(StopReason::DeviceGone);
                return;
            }
            Err(error) => {
                self.stats.update(|s| s.rx_errors += 1);
                let count = self.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1;
                warn!("RX transfer failed: {} ({} consecutive)", error, count);
                if count > self.max_errors {
                    error!("Too many consecutive RX errors ({}), stopping RX", count);
                    *state = RxState::Stopped(StopReason::TooManyErrors);
                    return;
                }
            }
        }

        self.resubmit(&mut state, slot);
    }

    /// Resubmit the persistent slot, retrying until it is accepted or the
    /// error budget runs out. Called with the state lock held.
    fn resubmit(self: &Arc<Self>, state: &mut RxState, mut slot: TransferSlot) {
        loop {
            slot.rearm();
            let error = match self.submit(slot) {
                Ok(()) => return,
                Err(SubmitError { slot: returned, error }) => {
                    slot = returned;
                    error
                }
            };

            self.stats.update(|s| s.rx_errors += 1);
            let count = self.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1;
            warn!("Failed to resubmit RX transfer: {} ({} consecutive)", error, count);

            if error.is_fatal() {
                info!("RX endpoint gone, stopping RX");
                *state = RxState::Stopped(StopReason::DeviceGone);
                return;
            }
            if count > self.max_errors {
                error!("Too many consecutive RX errors ({}), stopping RX", count);
                *state = RxState::Stopped(StopReason::TooManyErrors);
                return;
            }
        }
    }

    /// Copy the received bytes into an owned packet and hand it upward
    fn deliver(&self, data: &[u8]) {
        let Some(packet) = (self.copy_out)(data) else {
            warn!("Out of memory for {} byte RX packet, dropping", data.len());
            self.stats.update(|s| s.rx_dropped += 1);
            return;
        };

        let meta = RxMeta {
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            endpoint: self.endpoint,
            timestamp_us: now_us(),
        };
        let len = packet.len() as u64;

        self.sink.deliver(packet, meta);
        self.stats.update(|s| {
            s.rx_packets += 1;
            s.rx_bytes += len;
        });
    }
}

/// Copy out of the reused receive buffer with fallible allocation
fn copy_received(data: &[u8]) -> Option<Bytes> {
    let mut copy = Vec::new();
    copy.try_reserve_exact(data.len()).ok()?;
    copy.extend_from_slice(data);
    Some(Bytes::from(copy))
}

fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
