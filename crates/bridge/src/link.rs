//! Glue between the engine's synchronous callbacks and the tokio side
//!
//! - [`ChannelSink`]: inbound packets into a bounded async-channel
//! - [`WatchCongestion`]: pause/resume published on a `watch` channel

use async_channel::{Receiver, Sender, TrySendError};
use bytes::Bytes;
use engine::{CongestionSignal, RxMeta, UpboundSink};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tracing::trace;

/// Create a sink and the receiver that drains it
pub fn uplink(capacity: usize) -> (Arc<ChannelSink>, UplinkReceiver) {
    let (tx, rx) = async_channel::bounded(capacity);
    let sink = Arc::new(ChannelSink {
        tx,
        dropped: AtomicU64::new(0),
    });
    (sink, UplinkReceiver { rx })
}

/// Never blocks the completion context: a full channel drops the packet
pub struct ChannelSink {
    tx: Sender<Bytes>,
    dropped: AtomicU64,
}

impl ChannelSink {
    /// Packets dropped because the receiver fell behind or went away
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl UpboundSink for ChannelSink {
    fn deliver(&self, packet: Bytes, meta: RxMeta) {
        match self.tx.try_send(packet) {
            Ok(()) => trace!("Uplink packet {} queued", meta.sequence),
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                trace!("Uplink full, dropping packet {}", meta.sequence);
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

pub struct UplinkReceiver {
    rx: Receiver<Bytes>,
}

impl UplinkReceiver {
    /// Next inbound packet; `None` once every sink is gone
    pub async fn recv(&self) -> Option<Bytes> {
        self.rx.recv().await.ok()
    }
}

/// Congestion state as a `watch` value: `true` while paused
pub struct WatchCongestion {
    paused: watch::Sender<bool>,
}

impl WatchCongestion {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self { paused }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.paused.subscribe()
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }
}

impl Default for WatchCongestion {
    fn default() -> Self {
        Self::new()
    }
}

impl CongestionSignal for WatchCongestion {
    fn pause(&self) {
        self.paused.send_replace(true);
    }

    fn resume(&self) {
        self.paused.send_replace(false);
    }
}

/// Wait until the source may offer packets again
pub async fn wait_clear(paused: &mut watch::Receiver<bool>) {
    if paused.wait_for(|paused| !*paused).await.is_err() {
        // Sender gone: the session is ending, never report clear
        std::future::pending::<()>().await;
    }
}
