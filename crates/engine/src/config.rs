//! Engine configuration
//!
//! Fixed at session construction. Deserializable so the bridge can embed it as
//! the `[engine]` table of its TOML file.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};

/// Largest packet, and the receive buffer size, in bytes
pub const DEFAULT_MAX_TRANSFER_SIZE: usize = 2048;

/// Queue length above which the congestion signal engages
pub const DEFAULT_TX_QUEUE_HIGH: usize = 100;

/// Queue length below which the congestion signal is released
pub const DEFAULT_TX_QUEUE_LOW: usize = 50;

/// Consecutive RX errors tolerated before the receive loop stops
pub const DEFAULT_MAX_RX_ERRORS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum transfer size in bytes; larger packets are dropped
    #[serde(default = "EngineConfig::default_max_transfer_size")]
    pub max_transfer_size: usize,
    /// Congestion high watermark (queue length)
    #[serde(default = "EngineConfig::default_tx_queue_high")]
    pub tx_queue_high: usize,
    /// Congestion low watermark (queue length)
    #[serde(default = "EngineConfig::default_tx_queue_low")]
    pub tx_queue_low: usize,
    /// Hard queue limit; enqueue rejects once reached
    #[serde(default = "EngineConfig::default_tx_queue_limit")]
    pub tx_queue_limit: usize,
    /// Consecutive RX errors tolerated before the receive loop stops
    #[serde(default = "EngineConfig::default_max_rx_errors")]
    pub max_rx_errors: u32,
    /// Maximum number of transfer slots alive at once
    #[serde(default = "EngineConfig::default_max_slots")]
    pub max_slots: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_transfer_size: Self::default_max_transfer_size(),
            tx_queue_high: Self::default_tx_queue_high(),
            tx_queue_low: Self::default_tx_queue_low(),
            tx_queue_limit: Self::default_tx_queue_limit(),
            max_rx_errors: Self::default_max_rx_errors(),
            max_slots: Self::default_max_slots(),
        }
    }
}

impl EngineConfig {
    fn default_max_transfer_size() -> usize {
        DEFAULT_MAX_TRANSFER_SIZE
    }

    fn default_tx_queue_high() -> usize {
        DEFAULT_TX_QUEUE_HIGH
    }

    fn default_tx_queue_low() -> usize {
        DEFAULT_TX_QUEUE_LOW
    }

    fn default_tx_queue_limit() -> usize {
        1024
    }

    fn default_max_rx_errors() -> u32 {
        DEFAULT_MAX_RX_ERRORS
    }

    fn default_max_slots() -> usize {
        8 // one persistent RX slot, one TX slot, headroom
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.max_transfer_size == 0 {
            return Err(EngineError::Config(
                "max_transfer_size must be greater than 0".to_string(),
            ));
        }

        if self.tx_queue_low >= self.tx_queue_high {
            return Err(EngineError::Config(format!(
                "tx_queue_low ({}) must be below tx_queue_high ({})",
                self.tx_queue_low, self.tx_queue_high
            )));
        }

        if self.tx_queue_limit <= self.tx_queue_high {
            return Err(EngineError::Config(format!(
                "tx_queue_limit ({}) must exceed tx_queue_high ({})",
                self.tx_queue_limit, self.tx_queue_high
            )));
        }

        // The RX slot is persistent; TX needs one more
        if self.max_slots < 2 {
            return Err(EngineError::Config(format!(
                "max_slots ({}) must be at least 2",
                self.max_slots
            )));
        }

        Ok(())
    }
}
