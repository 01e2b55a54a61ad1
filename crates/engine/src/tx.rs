//! Transmit path
//!
//! Three execution contexts meet here:
//!
//! ```text
//! enqueue (any thread) ──push──► TxQueue ──pop──► tx-worker thread ──submit──► Transport
//!        │                          ▲                    │                        │
//!        └── wake if gate clear     │                    └── sets InFlightGate    │
//!                                   └──── wake if queued ◄── completion ◄─────────┘
//!                                                             (clears gate)
//! ```
//!
//! The worker submits at most one transfer and then stops; the completion of
//! that transfer clears the gate and wakes the worker again if packets remain.

use crate::gate::InFlightGate;
use crate::queue::{EnqueueStatus, RejectReason, TxQueue};
use crate::sink::CongestionSignal;
use crate::slot::{SlotLedger, TransferOutcome, TransferSlot};
use crate::stats::Stats;
use crate::transport::{SubmitError, Transport};
use async_channel::{Receiver, Sender, TrySendError};
use bytes::Bytes;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, trace, warn};

pub(crate) struct TxPath {
    transport: Arc<dyn Transport>,
    endpoint: Option<u8>,
    max_transfer_size: usize,
    queue: Mutex<TxQueue>,
    gate: InFlightGate,
    stats: Arc<Stats>,
    ledger: Arc<SlotLedger>,
    congestion: Arc<dyn CongestionSignal>,
    /// Capacity 1: a wake-up that is already pending absorbs further ones
    wake: Sender<()>,
}

pub(crate) struct TxSettings {
    pub endpoint: Option<u8>,
    pub max_transfer_size: usize,
    pub queue: TxQueue,
}

impl TxPath {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        settings: TxSettings,
        stats: Arc<Stats>,
        ledger: Arc<SlotLedger>,
        congestion: Arc<dyn CongestionSignal>,
    ) -> (Arc<Self>, Receiver<()>) {
        let (wake, wake_rx) = async_channel::bounded(1);

        let path = Arc::new(Self {
            transport,
            endpoint: settings.endpoint,
            max_transfer_size: settings.max_transfer_size,
            queue: Mutex::new(settings.queue),
            gate: InFlightGate::new(),
            stats,
            ledger,
            congestion,
            wake,
        });

        (path, wake_rx)
    }

    fn lock_queue(&self) -> MutexGuard<'_, TxQueue> {
        // Every TxQueue method leaves it consistent, so a poisoned lock is usable
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Accept a packet for transmission. Never blocks.
    pub(crate) fn enqueue(&self, packet: Bytes) -> EnqueueStatus {
        if packet.is_empty() {
            return self.reject(RejectReason::EmptyPacket);
        }
        if self.endpoint.is_none() {
            return self.reject(RejectReason::NotReady);
        }

        let len = packet.len();
        let pushed = {
            let mut queue = self.lock_queue();
            let pushed = queue.push(packet);
            if let Ok(p) = pushed
                && p.engaged
            {
                warn!("TX queue congested ({} queued), pausing source", queue.len());
                self.congestion.pause();
            }
            pushed
        };

        let pushed = match pushed {
            Ok(pushed) => pushed,
            Err(reason) => return self.reject(reason),
        };
        trace!("Queued {} byte packet", len);

        if !self.gate.is_held() {
            self.wake_worker();
        }

        if pushed.congested {
            EnqueueStatus::Busy
        } else {
            EnqueueStatus::Accepted
        }
    }

    fn reject(&self, reason: RejectReason) -> EnqueueStatus {
        debug!("Rejected TX packet: {:?}", reason);
        self.stats.update(|s| s.tx_dropped += 1);
        EnqueueStatus::Rejected(reason)
    }

    fn wake_worker(&self) {
        match self.wake.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Closed(())) => trace!("TX worker already shut down"),
        }
    }

    /// Drain the queue until one transfer is in flight or nothing is left.
    /// Only ever runs on the worker thread.
    fn run(self: &Arc<Self>) {
        let Some(endpoint) = self.endpoint else {
            return;
        };

        loop {
            let Some(packet) = self.lock_queue().pop() else {
                break;
            };

            if !self.gate.try_acquire() {
                if self.requeue_head(packet) {
                    continue;
                }
                break;
            }

            if packet.len() > self.max_transfer_size {
                warn!(
                    "Dropping oversized packet ({} > {} bytes)",
                    packet.len(),
                    self.max_transfer_size
                );
                self.stats.update(|s| s.tx_dropped += 1);
                self.gate.release();
                continue;
            }

            let slot = match TransferSlot::outbound(&self.ledger, endpoint, packet) {
                Ok(slot) => slot,
                Err(e) => {
                    warn!("Dropping TX packet: {}", e);
                    self.stats.update(|s| s.tx_dropped += 1);
                    self.gate.release();
                    continue;
                }
            };

            let (id, len) = (slot.id(), slot.len());
            let path = Arc::clone(self);
            match self
                .transport
                .submit(slot, Box::new(move |slot| path.complete(slot)))
            {
                Ok(()) => {
                    debug!("Submitted TX transfer {} ({} bytes)", id, len);
                    self.stats.update(|s| {
                        s.tx_packets += 1;
                        s.tx_bytes += len as u64;
                    });
                    // The gate stays held until the completion fires
                    break;
                }
                Err(SubmitError { slot, error }) => {
                    warn!("Failed to submit TX transfer {}: {}", id, error);
                    self.stats.update(|s| {
                        s.tx_errors += 1;
                        s.tx_dropped += 1;
                    });
                    drop(slot);
                    self.gate.release();
                }
            }
        }

        let mut queue = self.lock_queue();
        if !self.gate.is_held() && queue.relieve_below_low() {
            debug!("TX queue drained to {}, resuming source", queue.len());
            self.congestion.resume();
        }
    }

    /// Put a popped packet back at the head after losing the gate. Returns
    /// true when the outstanding transfer completed in the meantime, in which
    /// case its completion saw an empty queue and sent no wake-up.
    fn requeue_head(&self, packet: Bytes) -> bool {
        let mut queue = self.lock_queue();
        queue.push_front(packet);
        if self.gate.is_held() {
            // Released after this point: the completion finds the packet queued
            trace!("TX busy, requeued packet at head");
            return false;
        }
        debug!("TX transfer completed while requeueing, retrying");
        true
    }

    /// Completion handler for a TX slot. Runs in the transport's completion
    /// context.
    fn complete(&self, slot: TransferSlot) {
        let id = slot.id();
        match slot.outcome() {
            TransferOutcome::Completed { actual_length } => {
                if actual_length < slot.len() {
                    debug!(
                        "TX transfer {} short write ({} of {} bytes)",
                        id,
                        actual_length,
                        slot.len()
                    );
                }
                trace!("TX transfer {} complete", id);
            }
            TransferOutcome::Failed(error) => {
                warn!("TX transfer {} failed: {}", id, error);
                self.stats.update(|s| s.tx_errors += 1);
            }
            TransferOutcome::Pending => {
                error!("TX transfer {} completed without an outcome", id);
                self.stats.update(|s| s.tx_errors += 1);
            }
        }

        // Buffer, packet and slot go together, strictly before the gate opens
        drop(slot);
        self.gate.release();

        let mut queue = self.lock_queue();
        if !queue.is_empty() {
            self.wake_worker();
        } else if queue.relieve_if_empty() {
            debug!("TX queue empty, resuming source");
            self.congestion.resume();
        }
    }

    /// Reject all further enqueues
    pub(crate) fn close(&self) {
        self.lock_queue().close();
    }

    /// Let the worker thread exit once it has finished its current run
    pub(crate) fn shutdown_worker(&self) {
        self.wake.close();
    }

    /// Cancel the outstanding TX transfer, if any, and wait for its completion
    pub(crate) fn cancel_in_flight(&self) {
        if let Some(endpoint) = self.endpoint {
            self.transport.cancel(endpoint);
        }
    }

    /// Discard everything still queued, counting each packet as dropped
    pub(crate) fn discard_queued(&self) -> usize {
        let dropped = self.lock_queue().discard_all();
        if dropped > 0 {
            self.stats.update(|s| s.tx_dropped += dropped as u64);
        }
        dropped
    }

    pub(crate) fn queued(&self) -> usize {
        self.lock_queue().len()
    }

    pub(crate) fn is_congested(&self) -> bool {
        self.lock_queue().is_congested()
    }

    pub(crate) fn in_flight(&self) -> bool {
        self.gate.is_held()
    }
}

/// Spawn the single worker thread for one session
pub(crate) fn spawn_worker(
    path: Arc<TxPath>,
    wake_rx: Receiver<()>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("tx-worker".to_string())
        .spawn(move || {
            debug!("TX worker started");
            while wake_rx.recv_blocking().is_ok() {
                path.run();
            }
            debug!("TX worker stopped");
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{IN_EP, MockTransport, OUT_EP, RecordingCongestion};

    type Harness = (Arc<TxPath>, Receiver<()>, Arc<Stats>, Arc<SlotLedger>);

    /// A TX path without a worker thread; tests call `run` themselves
    fn tx_path(transport: &Arc<MockTransport>, max_slots: usize) -> Harness {
        let stats = Arc::new(Stats::new());
        let ledger = SlotLedger::new(max_slots);
        let (path, wake_rx) = TxPath::new(
            transport.clone(),
            TxSettings {
                endpoint: Some(OUT_EP),
                max_transfer_size: 2048,
                queue: TxQueue::new(100, 50, 1024),
            },
            Arc::clone(&stats),
            Arc::clone(&ledger),
            Arc::new(RecordingCongestion::new()),
        );
        (path, wake_rx, stats, ledger)
    }

    fn drain(wake_rx: &Receiver<()>) {
        while wake_rx.try_recv().is_ok() {}
    }

    #[test]
    fn test_completion_between_pop_and_requeue() {
        let transport = MockTransport::new();
        let (path, wake_rx, _stats, _ledger) = tx_path(&transport, 4);

        path.enqueue(Bytes::from_static(b"first"));
        path.run();
        assert_eq!(transport.pending(OUT_EP), 1);
        drain(&wake_rx);

        // Gate held: no wake-up
        path.enqueue(Bytes::from_static(b"second"));
        assert!(wake_rx.try_recv().is_err());

        // Worker pops and loses the gate, then the transfer finishes
        let packet = path.lock_queue().pop().unwrap();
        assert!(!path.gate.try_acquire());
        assert!(transport.complete_out(OUT_EP));

        // The completion saw an empty queue and scheduled nothing
        assert!(wake_rx.try_recv().is_err());
        assert!(!path.in_flight());

        assert!(path.requeue_head(packet));
        assert_eq!(path.queued(), 1);

        path.run();
        assert_eq!(
            transport.sent(OUT_EP),
            vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")]
        );
        assert_eq!(path.queued(), 0);
        assert!(path.in_flight());
    }

    #[test]
    fn test_requeue_while_in_flight_waits_for_completion() {
        let transport = MockTransport::new();
        let (path, wake_rx, _stats, _ledger) = tx_path(&transport, 4);

        path.enqueue(Bytes::from_static(b"first"));
        path.run();
        path.enqueue(Bytes::from_static(b"second"));
        drain(&wake_rx);

        let packet = path.lock_queue().pop().unwrap();
        assert!(!path.gate.try_acquire());
        assert!(!path.requeue_head(packet));

        // The completion finds the packet queued and wakes the worker
        assert!(transport.complete_out(OUT_EP));
        assert!(wake_rx.try_recv().is_ok());

        path.run();
        assert_eq!(transport.sent(OUT_EP).len(), 2);
    }

    #[test]
    fn test_slot_exhaustion_drops_packet_and_releases_gate() {
        let transport = MockTransport::new();
        let (path, _wake_rx, stats, ledger) = tx_path(&transport, 1);
        let held = TransferSlot::inbound(&ledger, IN_EP, 64).unwrap();

        assert_eq!(
            path.enqueue(Bytes::from_static(b"lost")),
            EnqueueStatus::Accepted
        );
        path.run();

        assert_eq!(stats.snapshot().tx_dropped, 1);
        assert_eq!(stats.snapshot().tx_packets, 0);
        assert_eq!(transport.submit_count(OUT_EP), 0);
        assert!(!path.in_flight());
        assert_eq!(path.queued(), 0);

        drop(held);
        path.enqueue(Bytes::from_static(b"kept"));
        path.run();

        assert_eq!(transport.sent(OUT_EP), vec![Bytes::from_static(b"kept")]);
        assert!(path.in_flight());
        assert_eq!(stats.snapshot().tx_dropped, 1);
        assert_eq!(stats.snapshot().tx_packets, 1);
    }
}
