//! Per-device engine session
//!
//! One [`Engine`] exists per attached device. Everything it owns (queue,
//! gate, worker thread, receive loop, slots) is created by [`Engine::start`]
//! and torn down by [`Engine::stop`] or on drop. Nothing survives into the
//! next attach.

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::queue::{EnqueueStatus, TxQueue};
use crate::rx::{RxLoop, RxSettings, RxState};
use crate::sink::{CongestionSignal, UpboundSink};
use crate::slot::SlotLedger;
use crate::stats::{NetStats, Stats};
use crate::transport::{Direction, Endpoints, Transport};
use crate::tx::{self, TxPath, TxSettings};
use bytes::Bytes;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use tracing::{error, info, warn};

/// Point-in-time health of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStatus {
    /// False once the session has been stopped
    pub running: bool,
    pub rx: RxState,
    pub rx_consecutive_errors: u32,
    /// A TX transfer is outstanding
    pub tx_in_flight: bool,
    /// Packets waiting in the TX queue
    pub queued: usize,
    pub congested: bool,
    /// Transfer slots currently allocated
    pub live_slots: usize,
    pub stats: NetStats,
}

impl EngineStatus {
    /// Running with the receive loop armed
    pub fn is_healthy(&self) -> bool {
        self.running && self.rx == RxState::Armed
    }
}

/// Asynchronous bulk-transfer engine for one device
pub struct Engine {
    tx: Arc<TxPath>,
    rx: Arc<RxLoop>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<Stats>,
    ledger: Arc<SlotLedger>,
}

impl Engine {
    /// Validate the endpoints, spawn the TX worker and arm the receive loop.
    ///
    /// A missing OUT endpoint is tolerated: the session runs receive-only and
    /// every enqueue is rejected with `NotReady`.
    pub fn start(
        transport: Arc<dyn Transport>,
        endpoints: Endpoints,
        config: EngineConfig,
        sink: Arc<dyn UpboundSink>,
        congestion: Arc<dyn CongestionSignal>,
    ) -> Result<Self> {
        config.validate()?;

        let inbound = endpoints
            .inbound
            .ok_or(EngineError::MissingEndpoint(Direction::In))?;
        check_direction(inbound, Direction::In)?;

        match endpoints.outbound {
            Some(outbound) => check_direction(outbound, Direction::Out)?,
            None => warn!("No bulk OUT endpoint, transmit disabled"),
        }

        let stats = Arc::new(Stats::new());
        let ledger = SlotLedger::new(config.max_slots);

        let (tx, wake_rx) = TxPath::new(
            Arc::clone(&transport),
            TxSettings {
                endpoint: endpoints.outbound,
                max_transfer_size: config.max_transfer_size,
                queue: TxQueue::new(
                    config.tx_queue_high,
                    config.tx_queue_low,
                    config.tx_queue_limit,
                ),
            },
            Arc::clone(&stats),
            Arc::clone(&ledger),
            congestion,
        );
        let worker = tx::spawn_worker(Arc::clone(&tx), wake_rx)?;

        let rx = RxLoop::new(
            transport,
            RxSettings {
                endpoint: inbound,
                buffer_size: config.max_transfer_size,
                max_errors: config.max_rx_errors,
            },
            sink,
            Arc::clone(&stats),
            Arc::clone(&ledger),
        );

        if let Err(e) = rx.start() {
            tx.close();
            tx.shutdown_worker();
            if worker.join().is_err() {
                error!("TX worker thread panicked");
            }
            return Err(e);
        }

        info!(
            "Engine started (in {:#04x}, out {})",
            inbound,
            endpoints
                .outbound
                .map(|ep| format!("{:#04x}", ep))
                .unwrap_or_else(|| "none".to_string())
        );

        Ok(Self {
            tx,
            rx,
            worker: Mutex::new(Some(worker)),
            stats,
            ledger,
        })
    }

    /// Offer a packet for transmission. Never blocks.
    pub fn enqueue(&self, packet: Bytes) -> EnqueueStatus {
        self.tx.enqueue(packet)
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            running: self.is_running(),
            rx: self.rx.state(),
            rx_consecutive_errors: self.rx.consecutive_errors(),
            tx_in_flight: self.tx.in_flight(),
            queued: self.tx.queued(),
            congested: self.tx.is_congested(),
            live_slots: self.ledger.live(),
            stats: self.stats.snapshot(),
        }
    }

    pub fn stats(&self) -> NetStats {
        self.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Shut the session down and return the final counters.
    ///
    /// Blocks until every outstanding transfer has completed and every slot
    /// has been released. Calling it again just returns the counters.
    pub fn stop(&self) -> NetStats {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(worker) = worker {
            info!("Stopping engine");

            self.tx.close();
            self.rx.stop();

            self.tx.shutdown_worker();
            if worker.join().is_err() {
                error!("TX worker thread panicked");
            }

            self.tx.cancel_in_flight();
            let discarded = self.tx.discard_queued();

            let stats = self.stats.snapshot();
            info!(
                "Engine stopped: tx {} packets ({} errors, {} dropped, {} discarded at stop), rx {} packets ({} errors)",
                stats.tx_packets,
                stats.tx_errors,
                stats.tx_dropped,
                discarded,
                stats.rx_packets,
                stats.rx_errors
            );
        }

        self.stats.snapshot()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn check_direction(endpoint: u8, expected: Direction) -> Result<()> {
    if Direction::of(endpoint) == expected {
        Ok(())
    } else {
        Err(EngineError::InvalidEndpoint { endpoint, expected })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::IgnoreCongestion;
    use crate::test_utils::{IN_EP, MockTransport, OUT_EP, RecordingSink};
    use crate::transport::TransferError;

    fn start(transport: &Arc<MockTransport>, endpoints: Endpoints) -> Result<Engine> {
        Engine::start(
            transport.clone(),
            endpoints,
            EngineConfig::default(),
            Arc::new(RecordingSink::new()),
            Arc::new(IgnoreCongestion),
        )
    }

    #[test]
    fn test_start_arms_receive() {
        let transport = MockTransport::new();
        let engine = start(&transport, Endpoints::new(IN_EP, OUT_EP)).unwrap();

        let status = engine.status();
        assert!(status.is_healthy());
        assert_eq!(status.live_slots, 1);
        assert!(!status.tx_in_flight);
        assert_eq!(transport.pending(IN_EP), 1);
    }

    #[test]
    fn test_missing_inbound_endpoint() {
        let transport = MockTransport::new();
        let endpoints = Endpoints {
            inbound: None,
            outbound: Some(OUT_EP),
        };

        let err = start(&transport, endpoints).err().unwrap();
        assert!(matches!(err, EngineError::MissingEndpoint(Direction::In)));
    }

    #[test]
    fn test_swapped_endpoints_rejected() {
        let transport = MockTransport::new();

        let err = start(&transport, Endpoints::new(OUT_EP, IN_EP)).err().unwrap();
        assert!(matches!(
            err,
            EngineError::InvalidEndpoint {
                endpoint: OUT_EP,
                expected: Direction::In
            }
        ));
        assert_eq!(transport.submit_count(IN_EP), 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let transport = MockTransport::new();
        let config = EngineConfig {
            tx_queue_low: 200,
            ..Default::default()
        };

        let result = Engine::start(
            transport,
            Endpoints::new(IN_EP, OUT_EP),
            config,
            Arc::new(RecordingSink::new()),
            Arc::new(IgnoreCongestion),
        );
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[test]
    fn test_initial_submit_failure_fails_start() {
        let transport = MockTransport::new();
        transport.fail_next_submit(IN_EP, TransferError::Io);

        let err = start(&transport, Endpoints::new(IN_EP, OUT_EP)).err().unwrap();
        assert!(matches!(err, EngineError::Submit(TransferError::Io)));
        assert_eq!(transport.pending(IN_EP), 0);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let transport = MockTransport::new();
        let engine = start(&transport, Endpoints::new(IN_EP, OUT_EP)).unwrap();

        let first = engine.stop();
        let second = engine.stop();

        assert_eq!(first, second);
        assert!(!engine.is_running());
        assert_eq!(engine.status().live_slots, 0);
        assert_eq!(transport.cancel_requests(IN_EP), 1);
        assert_eq!(transport.cancel_requests(OUT_EP), 1);
    }

    #[test]
    fn test_drop_stops_session() {
        let transport = MockTransport::new();
        let engine = start(&transport, Endpoints::new(IN_EP, OUT_EP)).unwrap();
        assert_eq!(transport.pending(IN_EP), 1);

        drop(engine);

        assert_eq!(transport.pending(IN_EP), 0);
        assert_eq!(transport.cancel_requests(IN_EP), 1);
    }
}
