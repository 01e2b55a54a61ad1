//! rusb-backed transfer transport
//!
//! rusb exposes only blocking bulk calls, so each endpoint gets a dedicated
//! lane thread (`usb-ep-0xNN`) fed through an async-channel. A lane runs one
//! transfer at a time as a series of short blocking polls, checking its cancel
//! flag between polls, and then runs the completion handler on its own thread.
//!
//! rusb reports a timed-out bulk call without the byte count libusb already
//! moved. An OUT transfer that times out is therefore failed rather than
//! retried, since a retry would resend a prefix the device already has. IN
//! transfers keep polling: the radio terminates every frame with a short
//! packet and the poll slice is far longer than one frame takes on the bus,
//! so a slice ending mid-frame only happens when the device stalls, and the
//! lost prefix then surfaces as a truncated frame.

use async_channel::{Receiver, Sender, TrySendError};
use engine::{CompletionHandler, Direction, SubmitError, TransferError, TransferSlot, Transport};
use rusb::{Context, DeviceHandle};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Jobs a lane accepts before `submit` reports `Busy`
const LANE_DEPTH: usize = 4;

/// Blocking bulk I/O on an opened device
pub trait BulkIo: Send + Sync + 'static {
    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize>;
    fn write_bulk(&self, endpoint: u8, buf: &[u8], timeout: Duration) -> rusb::Result<usize>;
}

impl BulkIo for DeviceHandle<Context> {
    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
        DeviceHandle::read_bulk(self, endpoint, buf, timeout)
    }

    fn write_bulk(&self, endpoint: u8, buf: &[u8], timeout: Duration) -> rusb::Result<usize> {
        DeviceHandle::write_bulk(self, endpoint, buf, timeout)
    }
}

/// Map rusb::Error to engine::TransferError
pub fn map_rusb_error(err: rusb::Error) -> TransferError {
    match err {
        rusb::Error::Timeout => TransferError::Timeout,
        rusb::Error::Pipe => TransferError::Pipe,
        rusb::Error::NoDevice | rusb::Error::NotFound => TransferError::NoDevice,
        rusb::Error::Busy => TransferError::Busy,
        rusb::Error::Overflow => TransferError::Overflow,
        rusb::Error::Io => TransferError::Io,
        rusb::Error::InvalidParam => TransferError::InvalidParam,
        rusb::Error::NoMem => TransferError::NoMem,
        rusb::Error::Access => TransferError::Other(-3),
        rusb::Error::Interrupted => TransferError::Other(-10),
        rusb::Error::NotSupported => TransferError::Other(-12),
        _ => TransferError::Other(-99),
    }
}

struct Job {
    slot: TransferSlot,
    on_complete: CompletionHandler,
}

/// Cancellation bookkeeping shared between a lane thread and `cancel`
#[derive(Default)]
struct LaneState {
    cancel: AtomicBool,
    /// Jobs queued or executing, handlers included
    outstanding: Mutex<usize>,
    idle: Condvar,
}

impl LaneState {
    fn lock(&self) -> MutexGuard<'_, usize> {
        self.outstanding.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self) {
        *self.lock() += 1;
    }

    fn finish(&self) {
        let mut outstanding = self.lock();
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.idle.notify_all();
        }
    }

    fn wait_idle(&self) {
        let mut outstanding = self.lock();
        while *outstanding > 0 {
            outstanding = self
                .idle
                .wait(outstanding)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

struct Lane {
    jobs: Sender<Job>,
    state: Arc<LaneState>,
    thread: Option<JoinHandle<()>>,
}

pub struct UsbTransport {
    lanes: HashMap<u8, Lane>,
}

impl UsbTransport {
    /// Spawn one lane per endpoint
    pub fn new(io: Arc<dyn BulkIo>, endpoints: &[u8], poll_timeout: Duration) -> io::Result<Self> {
        let mut lanes = HashMap::new();

        for &endpoint in endpoints {
            let (jobs, job_rx) = async_channel::bounded(LANE_DEPTH);
            let state = Arc::new(LaneState::default());

            let thread = {
                let io = Arc::clone(&io);
                let state = Arc::clone(&state);
                thread::Builder::new()
                    .name(format!("usb-ep-{:#04x}", endpoint))
                    .spawn(move || run_lane(io, endpoint, job_rx, state, poll_timeout))?
            };

            lanes.insert(
                endpoint,
                Lane {
                    jobs,
                    state,
                    thread: Some(thread),
                },
            );
        }

        Ok(Self { lanes })
    }
}

impl Transport for UsbTransport {
    fn submit(
        &self,
        slot: TransferSlot,
        on_complete: CompletionHandler,
    ) -> Result<(), SubmitError> {
        let Some(lane) = self.lanes.get(&slot.endpoint()) else {
            return Err(SubmitError {
                slot,
                error: TransferError::InvalidParam,
            });
        };

        lane.state.begin();
        match lane.jobs.try_send(Job { slot, on_complete }) {
            Ok(()) => Ok(()),
            Err(e) => {
                lane.state.finish();
                let error = match e {
                    TrySendError::Full(_) => TransferError::Busy,
                    TrySendError::Closed(_) => TransferError::Shutdown,
                };
                Err(SubmitError {
                    slot: e.into_inner().slot,
                    error,
                })
            }
        }
    }

    fn cancel(&self, endpoint: u8) {
        let Some(lane) = self.lanes.get(&endpoint) else {
            return;
        };

        lane.state.cancel.store(true, Ordering::SeqCst);
        lane.state.wait_idle();
        lane.state.cancel.store(false, Ordering::SeqCst);
        debug!("Endpoint {:#04x} cancelled", endpoint);
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        for lane in self.lanes.values() {
            lane.state.cancel.store(true, Ordering::SeqCst);
            lane.jobs.close();
        }
        for (endpoint, lane) in self.lanes.iter_mut() {
            if let Some(thread) = lane.thread.take()
                && thread.join().is_err()
            {
                warn!("Lane thread for endpoint {:#04x} panicked", endpoint);
            }
        }
    }
}

fn run_lane(
    io: Arc<dyn BulkIo>,
    endpoint: u8,
    jobs: Receiver<Job>,
    state: Arc<LaneState>,
    poll_timeout: Duration,
) {
    debug!("Lane for endpoint {:#04x} started", endpoint);

    while let Ok(Job {
        mut slot,
        on_complete,
    }) = jobs.recv_blocking()
    {
        match execute(io.as_ref(), &mut slot, &state.cancel, poll_timeout) {
            Ok(actual_length) => slot.complete(actual_length),
            Err(error) => slot.fail(error),
        }
        on_complete(slot);
        state.finish();
    }

    debug!("Lane for endpoint {:#04x} stopped", endpoint);
}

/// Run one transfer, polling until it moves data, fails or is cancelled
fn execute(
    io: &dyn BulkIo,
    slot: &mut TransferSlot,
    cancel: &AtomicBool,
    poll_timeout: Duration,
) -> Result<usize, TransferError> {
    let endpoint = slot.endpoint();

    loop {
        if cancel.load(Ordering::SeqCst) {
            trace!("Transfer {} on {:#04x} cancelled", slot.id(), endpoint);
            return Err(TransferError::Cancelled);
        }

        let result = match slot.direction() {
            Direction::In => io.read_bulk(endpoint, slot.buffer_mut(), poll_timeout),
            Direction::Out => io.write_bulk(endpoint, slot.data(), poll_timeout),
        };

        match (result, slot.direction()) {
            (Ok(n), _) => return Ok(n),
            (Err(rusb::Error::Timeout), Direction::In) => continue,
            (Err(e), _) => return Err(map_rusb_error(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::SlotLedger;
    use std::collections::VecDeque;
    use std::sync::mpsc;

    const IN_EP: u8 = 0x81;
    const OUT_EP: u8 = 0x02;
    const POLL: Duration = Duration::from_millis(5);

    /// Reads return queued results, or time out when none are queued
    #[derive(Default)]
    struct FakeIo {
        reads: Mutex<VecDeque<rusb::Result<Vec<u8>>>>,
        /// Errors returned by the next writes, before any succeed
        write_errors: Mutex<VecDeque<rusb::Error>>,
        /// Every write attempt, failed ones included
        writes: Mutex<Vec<Vec<u8>>>,
    }

    impl FakeIo {
        fn queue_read(&self, result: rusb::Result<Vec<u8>>) {
            self.reads.lock().unwrap().push_back(result);
        }

        fn fail_next_write(&self, error: rusb::Error) {
            self.write_errors.lock().unwrap().push_back(error);
        }
    }

    impl BulkIo for FakeIo {
        fn read_bulk(&self, _: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
            match self.reads.lock().unwrap().pop_front() {
                Some(Ok(data)) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(data.len())
                }
                Some(Err(e)) => Err(e),
                None => {
                    thread::sleep(timeout);
                    Err(rusb::Error::Timeout)
                }
            }
        }

        fn write_bulk(&self, _: u8, buf: &[u8], _: Duration) -> rusb::Result<usize> {
            self.writes.lock().unwrap().push(buf.to_vec());
            match self.write_errors.lock().unwrap().pop_front() {
                Some(e) => Err(e),
                None => Ok(buf.len()),
            }
        }
    }

    fn transport(io: &Arc<FakeIo>) -> UsbTransport {
        UsbTransport::new(io.clone(), &[IN_EP, OUT_EP], POLL).unwrap()
    }

    /// Completion handler forwarding the finished slot to the test
    fn forward(tx: mpsc::Sender<TransferSlot>) -> CompletionHandler {
        Box::new(move |slot| {
            let _ = tx.send(slot);
        })
    }

    #[test]
    fn test_map_rusb_error() {
        assert_eq!(map_rusb_error(rusb::Error::Timeout), TransferError::Timeout);
        assert_eq!(map_rusb_error(rusb::Error::Pipe), TransferError::Pipe);
        assert_eq!(map_rusb_error(rusb::Error::NoDevice), TransferError::NoDevice);
        assert!(map_rusb_error(rusb::Error::NoDevice).is_fatal());
        assert!(!map_rusb_error(rusb::Error::Io).is_fatal());
    }

    #[test]
    fn test_write_completes() {
        let io = Arc::new(FakeIo::default());
        let transport = transport(&io);
        let ledger = SlotLedger::new(4);
        let (tx, rx) = mpsc::channel();

        let slot =
            TransferSlot::outbound(&ledger, OUT_EP, bytes::Bytes::from_static(b"frame")).unwrap();
        transport.submit(slot, forward(tx)).unwrap();

        let slot = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(
            slot.outcome(),
            engine::TransferOutcome::Completed { actual_length: 5 }
        );
        assert_eq!(io.writes.lock().unwrap().as_slice(), &[b"frame".to_vec()]);
    }

    #[test]
    fn test_write_timeout_is_not_resent() {
        let io = Arc::new(FakeIo::default());
        io.fail_next_write(rusb::Error::Timeout);
        let transport = transport(&io);
        let ledger = SlotLedger::new(4);
        let (tx, rx) = mpsc::channel();

        let slot =
            TransferSlot::outbound(&ledger, OUT_EP, bytes::Bytes::from_static(b"frame")).unwrap();
        transport.submit(slot, forward(tx.clone())).unwrap();

        let slot = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(
            slot.outcome(),
            engine::TransferOutcome::Failed(TransferError::Timeout)
        );
        assert_eq!(io.writes.lock().unwrap().len(), 1);

        // The next packet goes out normally
        let slot =
            TransferSlot::outbound(&ledger, OUT_EP, bytes::Bytes::from_static(b"next")).unwrap();
        transport.submit(slot, forward(tx)).unwrap();
        let slot = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(
            slot.outcome(),
            engine::TransferOutcome::Completed { actual_length: 4 }
        );
        assert_eq!(
            io.writes.lock().unwrap().as_slice(),
            &[b"frame".to_vec(), b"next".to_vec()]
        );
    }

    #[test]
    fn test_read_polls_until_data() {
        let io = Arc::new(FakeIo::default());
        let transport = transport(&io);
        let ledger = SlotLedger::new(4);
        let (tx, rx) = mpsc::channel();

        transport
            .submit(TransferSlot::inbound(&ledger, IN_EP, 64).unwrap(), forward(tx))
            .unwrap();
        thread::sleep(POLL * 3);
        io.queue_read(Ok(vec![1, 2, 3]));

        let slot = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(slot.received(), &[1, 2, 3]);
    }

    #[test]
    fn test_read_error_is_mapped() {
        let io = Arc::new(FakeIo::default());
        io.queue_read(Err(rusb::Error::NoDevice));
        let transport = transport(&io);
        let ledger = SlotLedger::new(4);
        let (tx, rx) = mpsc::channel();

        transport
            .submit(TransferSlot::inbound(&ledger, IN_EP, 64).unwrap(), forward(tx))
            .unwrap();

        let slot = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(
            slot.outcome(),
            engine::TransferOutcome::Failed(TransferError::NoDevice)
        );
    }

    #[test]
    fn test_cancel_waits_for_handler() {
        let io = Arc::new(FakeIo::default());
        let transport = transport(&io);
        let ledger = SlotLedger::new(4);
        let handled = Arc::new(AtomicBool::new(false));

        let outcome = Arc::new(Mutex::new(None));
        let handler: CompletionHandler = {
            let handled = Arc::clone(&handled);
            let outcome = Arc::clone(&outcome);
            Box::new(move |slot: TransferSlot| {
                thread::sleep(Duration::from_millis(20));
                *outcome.lock().unwrap() = Some(slot.outcome());
                handled.store(true, Ordering::SeqCst);
            })
        };
        transport
            .submit(TransferSlot::inbound(&ledger, IN_EP, 64).unwrap(), handler)
            .unwrap();

        transport.cancel(IN_EP);

        assert!(handled.load(Ordering::SeqCst));
        assert_eq!(
            *outcome.lock().unwrap(),
            Some(engine::TransferOutcome::Failed(TransferError::Cancelled))
        );
        assert_eq!(ledger.live(), 0);

        // Lane is usable again afterwards
        let (tx, rx) = mpsc::channel();
        io.queue_read(Ok(vec![9]));
        transport
            .submit(TransferSlot::inbound(&ledger, IN_EP, 64).unwrap(), forward(tx))
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap().received(), &[9]);
    }

    #[test]
    fn test_cancel_idle_endpoint_returns() {
        let io = Arc::new(FakeIo::default());
        let transport = transport(&io);

        transport.cancel(OUT_EP);
        transport.cancel(0x7f);
    }

    #[test]
    fn test_unknown_endpoint_rejected() {
        let io = Arc::new(FakeIo::default());
        let transport = transport(&io);
        let ledger = SlotLedger::new(4);
        let (tx, _rx) = mpsc::channel();

        let err = transport
            .submit(TransferSlot::inbound(&ledger, 0x85, 64).unwrap(), forward(tx))
            .unwrap_err();
        assert_eq!(err.error, TransferError::InvalidParam);
        drop(err);
        assert_eq!(ledger.live(), 0);
    }
}
