//! Transmit queue with watermark backpressure
//!
//! Plain data structure; the caller provides the locking. Congestion uses
//! hysteresis: it engages when a push leaves more than `high` packets queued
//! and is released only once the queue falls below `low` (or empties), so
//! the signal does not chatter around a single threshold.

use bytes::Bytes;
use std::collections::VecDeque;

/// Result of offering a packet to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueStatus {
    /// Queued
    Accepted,
    /// Queued, but the queue is congested: the caller should pause
    Busy,
    /// Not queued; counted as dropped
    Rejected(RejectReason),
}

impl EnqueueStatus {
    /// True if the engine took ownership of the packet
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Accepted | Self::Busy)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Engine stopped, or no OUT endpoint
    NotReady,
    /// Zero-length packet
    EmptyPacket,
    /// Hard queue limit reached
    QueueFull,
}

/// Result of a successful push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pushed {
    /// This push engaged the congestion signal
    pub engaged: bool,
    /// The queue is congested after the push
    pub congested: bool,
}

#[derive(Debug)]
pub struct TxQueue {
    packets: VecDeque<Bytes>,
    accepting: bool,
    congested: bool,
    high: usize,
    low: usize,
    limit: usize,
}

impl TxQueue {
    pub fn new(high: usize, low: usize, limit: usize) -> Self {
        Self {
            packets: VecDeque::new(),
            accepting: true,
            congested: false,
            high,
            low,
            limit,
        }
    }

    /// Append a packet at the tail
    pub fn push(&mut self, packet: Bytes) -> Result<Pushed, RejectReason> {
        if !self.accepting {
            return Err(RejectReason::NotReady);
        }
        if self.packets.len() >= self.limit {
            return Err(RejectReason::QueueFull);
        }

        self.packets.push_back(packet);

        let engaged = !self.congested && self.packets.len() > self.high;
        if engaged {
            self.congested = true;
        }

        Ok(Pushed {
            engaged,
            congested: self.congested,
        })
    }

    /// Take the packet at the head
    pub fn pop(&mut self) -> Option<Bytes> {
        self.packets.pop_front()
    }

    /// Put a packet back at the head, ahead of everything queued after it
    pub fn push_front(&mut self, packet: Bytes) {
        self.packets.push_front(packet);
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn is_congested(&self) -> bool {
        self.congested
    }

    /// Release congestion if the queue has drained below the low watermark.
    /// Returns true if the signal was released by this call.
    pub fn relieve_below_low(&mut self) -> bool {
        self.relieve_if(self.packets.len() < self.low)
    }

    /// Release congestion if the queue is empty.
    /// Returns true if the signal was released by this call.
    pub fn relieve_if_empty(&mut self) -> bool {
        self.relieve_if(self.packets.is_empty())
    }

    fn relieve_if(&mut self, condition: bool) -> bool {
        if self.congested && condition {
            self.congested = false;
            true
        } else {
            false
        }
    }

    /// Stop accepting new packets
    pub fn close(&mut self) {
        self.accepting = false;
    }

    /// Discard everything queued, returning how many packets were dropped
    pub fn discard_all(&mut self) -> usize {
        let dropped = self.packets.len();
        self.packets.clear();
        self.congested = false;
        dropped
    }
}
