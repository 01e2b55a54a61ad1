//! Test doubles for the engine
//!
//! [`MockTransport`] parks submitted transfers until the test completes them,
//! which lets a test drive every completion by hand and observe exactly what
//! the engine submitted. Completion handlers run on whichever thread calls
//! `complete_*`/`fail`, standing in for the transport's completion context.

use crate::sink::{CongestionSignal, RxMeta, UpboundSink};
use crate::slot::TransferSlot;
use crate::transport::{CompletionHandler, Direction, SubmitError, TransferError, Transport};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Bulk IN endpoint used throughout the tests
pub const IN_EP: u8 = 0x81;
/// Bulk OUT endpoint used throughout the tests
pub const OUT_EP: u8 = 0x02;
/// Upper bound for anything a test waits on
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll `condition` until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
}

/// How [`MockTransport::cancel`] treats outstanding transfers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CancelMode {
    /// Fail every outstanding transfer with `Cancelled` right away
    #[default]
    Immediate,
    /// Leave them for the test to complete; `cancel` blocks until it does
    Deferred,
}

struct Parked {
    slot: TransferSlot,
    handler: CompletionHandler,
}

#[derive(Default)]
struct EndpointState {
    parked: VecDeque<Parked>,
    /// Handlers currently running
    completing: usize,
    submit_failures: VecDeque<TransferError>,
    submit_count: usize,
    max_in_flight: usize,
    cancel_requests: usize,
    /// Payloads of accepted OUT submissions, in order
    sent: Vec<Bytes>,
}

/// In-memory [`Transport`] driven by the test
pub struct MockTransport {
    endpoints: Mutex<HashMap<u8, EndpointState>>,
    changed: Condvar,
    cancel_mode: CancelMode,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Self::with_cancel_mode(CancelMode::Immediate)
    }

    pub fn with_cancel_mode(cancel_mode: CancelMode) -> Arc<Self> {
        Arc::new(Self {
            endpoints: Mutex::new(HashMap::new()),
            changed: Condvar::new(),
            cancel_mode,
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u8, EndpointState>> {
        self.endpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read<T>(&self, endpoint: u8, f: impl FnOnce(&EndpointState) -> T) -> T {
        f(self.lock().entry(endpoint).or_default())
    }

    /// Make the next submission on `endpoint` fail synchronously
    pub fn fail_next_submit(&self, endpoint: u8, error: TransferError) {
        self.lock()
            .entry(endpoint)
            .or_default()
            .submit_failures
            .push_back(error);
    }

    /// Transfers submitted and not yet completed
    pub fn pending(&self, endpoint: u8) -> usize {
        self.read(endpoint, |s| s.parked.len())
    }

    /// Accepted submissions so far
    pub fn submit_count(&self, endpoint: u8) -> usize {
        self.read(endpoint, |s| s.submit_count)
    }

    /// Highest number of simultaneously outstanding transfers seen
    pub fn max_in_flight(&self, endpoint: u8) -> usize {
        self.read(endpoint, |s| s.max_in_flight)
    }

    pub fn cancel_requests(&self, endpoint: u8) -> usize {
        self.read(endpoint, |s| s.cancel_requests)
    }

    /// Payloads accepted on an OUT endpoint, in submission order
    pub fn sent(&self, endpoint: u8) -> Vec<Bytes> {
        self.read(endpoint, |s| s.sent.clone())
    }

    /// Complete the oldest IN transfer with `data`. A payload larger than the
    /// slot fails the transfer with `Overflow`.
    pub fn complete_in(&self, endpoint: u8, data: &[u8]) -> bool {
        self.finish(endpoint, |slot| {
            if data.len() > slot.len() {
                slot.fail(TransferError::Overflow);
            } else {
                slot.buffer_mut()[..data.len()].copy_from_slice(data);
                slot.complete(data.len());
            }
        })
    }

    /// Complete the oldest OUT transfer in full
    pub fn complete_out(&self, endpoint: u8) -> bool {
        self.finish(endpoint, |slot| slot.complete(slot.len()))
    }

    /// Fail the oldest transfer with `error`
    pub fn fail(&self, endpoint: u8, error: TransferError) -> bool {
        self.finish(endpoint, |slot| slot.fail(error))
    }

    /// Run the oldest parked transfer's handler. Returns false if none.
    fn finish(&self, endpoint: u8, outcome: impl FnOnce(&mut TransferSlot)) -> bool {
        let parked = {
            let mut endpoints = self.lock();
            let state = endpoints.entry(endpoint).or_default();
            let Some(parked) = state.parked.pop_front() else {
                return false;
            };
            state.completing += 1;
            parked
        };

        let Parked { mut slot, handler } = parked;
        outcome(&mut slot);
        handler(slot);

        self.lock().entry(endpoint).or_default().completing -= 1;
        self.changed.notify_all();
        true
    }
}

impl Transport for MockTransport {
    fn submit(
        &self,
        slot: TransferSlot,
        on_complete: CompletionHandler,
    ) -> Result<(), SubmitError> {
        let mut endpoints = self.lock();
        let state = endpoints.entry(slot.endpoint()).or_default();

        if let Some(error) = state.submit_failures.pop_front() {
            return Err(SubmitError { slot, error });
        }

        state.submit_count += 1;
        if slot.direction() == Direction::Out {
            state.sent.push(Bytes::copy_from_slice(slot.data()));
        }
        state.parked.push_back(Parked {
            slot,
            handler: on_complete,
        });
        state.max_in_flight = state.max_in_flight.max(state.parked.len());
        drop(endpoints);

        self.changed.notify_all();
        Ok(())
    }

    fn cancel(&self, endpoint: u8) {
        let mut endpoints = self.lock();
        endpoints.entry(endpoint).or_default().cancel_requests += 1;
        self.changed.notify_all();

        loop {
            let state = endpoints.entry(endpoint).or_default();

            if self.cancel_mode == CancelMode::Immediate && !state.parked.is_empty() {
                let cancelled: Vec<Parked> = state.parked.drain(..).collect();
                let count = cancelled.len();
                state.completing += count;
                drop(endpoints);

                for Parked { mut slot, handler } in cancelled {
                    slot.fail(TransferError::Cancelled);
                    handler(slot);
                }

                endpoints = self.lock();
                endpoints.entry(endpoint).or_default().completing -= count;
                self.changed.notify_all();
                continue;
            }

            if state.parked.is_empty() && state.completing == 0 {
                return;
            }
            endpoints = self
                .changed
                .wait(endpoints)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// [`UpboundSink`] that keeps everything it is given
#[derive(Default)]
pub struct RecordingSink {
    packets: Mutex<Vec<(Bytes, RxMeta)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn packets(&self) -> Vec<(Bytes, RxMeta)> {
        self.packets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.packets.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl UpboundSink for RecordingSink {
    fn deliver(&self, packet: Bytes, meta: RxMeta) {
        self.packets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((packet, meta));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionEvent {
    Pause,
    Resume,
}

/// [`CongestionSignal`] that records every notification in order
#[derive(Default)]
pub struct RecordingCongestion {
    events: Mutex<Vec<CongestionEvent>>,
}

impl RecordingCongestion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CongestionEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn pauses(&self) -> usize {
        self.count(CongestionEvent::Pause)
    }

    pub fn resumes(&self) -> usize {
        self.count(CongestionEvent::Resume)
    }

    fn count(&self, kind: CongestionEvent) -> usize {
        self.events().iter().filter(|&&e| e == kind).count()
    }

    fn record(&self, event: CongestionEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl CongestionSignal for RecordingCongestion {
    fn pause(&self) {
        self.record(CongestionEvent::Pause);
    }

    fn resume(&self) {
        self.record(CongestionEvent::Resume);
    }
}
