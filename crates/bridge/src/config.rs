//! Bridge configuration management

use anyhow::{Context, Result, anyhow};
use engine::EngineConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub bridge: BridgeSettings,
    #[serde(default)]
    pub usb: UsbSettings,
    /// Transfer engine tuning
    #[serde(default)]
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSettings {
    #[serde(default = "BridgeSettings::default_log_level")]
    pub log_level: String,
    /// Local UDP address the bridge listens on
    #[serde(default = "BridgeSettings::default_bind_addr")]
    pub bind_addr: String,
    /// UDP peer that receives inbound packets and sends outbound ones
    #[serde(default = "BridgeSettings::default_peer_addr")]
    pub peer_addr: String,
    /// Status logging interval in seconds (0 = disabled)
    #[serde(default = "BridgeSettings::default_stats_interval")]
    pub stats_interval_secs: u64,
    /// Engine restarts allowed after the receive loop gives up
    #[serde(default = "BridgeSettings::default_max_restarts")]
    pub max_restarts: u32,
    /// Inbound packets buffered between the engine and the UDP socket
    #[serde(default = "BridgeSettings::default_uplink_capacity")]
    pub uplink_capacity: usize,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            bind_addr: Self::default_bind_addr(),
            peer_addr: Self::default_peer_addr(),
            stats_interval_secs: Self::default_stats_interval(),
            max_restarts: Self::default_max_restarts(),
            uplink_capacity: Self::default_uplink_capacity(),
        }
    }
}

impl BridgeSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }

    fn default_bind_addr() -> String {
        "127.0.0.1:7401".to_string()
    }

    fn default_peer_addr() -> String {
        "127.0.0.1:7402".to_string()
    }

    fn default_stats_interval() -> u64 {
        60
    }

    fn default_max_restarts() -> u32 {
        3
    }

    fn default_uplink_capacity() -> usize {
        256
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    /// Vendor ID, e.g. "0x2357"
    #[serde(default = "UsbSettings::default_vendor_id")]
    pub vendor_id: String,
    /// Product ID, e.g. "0x011e"
    #[serde(default = "UsbSettings::default_product_id")]
    pub product_id: String,
    /// Interface carrying the bulk data endpoints
    #[serde(default)]
    pub interface: u8,
    /// Blocking poll slice for each bulk call; bounds cancellation latency
    #[serde(default = "UsbSettings::default_poll_timeout")]
    pub poll_timeout_ms: u64,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            vendor_id: Self::default_vendor_id(),
            product_id: Self::default_product_id(),
            interface: 0,
            poll_timeout_ms: Self::default_poll_timeout(),
        }
    }
}

impl UsbSettings {
    // TP-Link Archer T2U Nano (AC600)
    fn default_vendor_id() -> String {
        "0x2357".to_string()
    }

    fn default_product_id() -> String {
        "0x011e".to_string()
    }

    fn default_poll_timeout() -> u64 {
        100
    }

    pub fn vendor_id(&self) -> Result<u16> {
        parse_hex_id(&self.vendor_id, "vendor_id")
    }

    pub fn product_id(&self) -> Result<u16> {
        parse_hex_id(&self.product_id, "product_id")
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

impl BridgeConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usbnet-bridge/bridge.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: BridgeConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usbnet-bridge").join("bridge.toml")
        } else {
            PathBuf::from(".config/usbnet-bridge/bridge.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.bridge.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.bridge.log_level,
                valid_levels.join(", ")
            ));
        }

        for (name, addr) in [
            ("bind_addr", &self.bridge.bind_addr),
            ("peer_addr", &self.bridge.peer_addr),
        ] {
            addr.parse::<SocketAddr>()
                .map_err(|_| anyhow!("Invalid {} '{}', expected IP:PORT", name, addr))?;
        }

        if self.bridge.uplink_capacity == 0 {
            return Err(anyhow!("uplink_capacity must be greater than 0"));
        }

        self.usb.vendor_id()?;
        self.usb.product_id()?;

        if self.usb.poll_timeout_ms == 0 {
            return Err(anyhow!("poll_timeout_ms must be greater than 0"));
        }

        self.engine.validate()?;

        Ok(())
    }
}

/// Parse a "0x"-prefixed 16-bit hex ID (VID or PID)
fn parse_hex_id(id: &str, name: &str) -> Result<u16> {
    let hex_part = id
        .strip_prefix("0x")
        .or_else(|| id.strip_prefix("0X"))
        .ok_or_else(|| anyhow!("Invalid {} '{}', must start with '0x' (e.g., '0x2357')", name, id))?;

    if hex_part.is_empty() || hex_part.len() > 4 {
        return Err(anyhow!(
            "Invalid {} '{}', hex part must be 1-4 digits",
            name,
            id
        ));
    }

    u16::from_str_radix(hex_part, 16)
        .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))
}

/// Expand `~` in a user-supplied path
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.bridge.log_level, "info");
        assert_eq!(config.usb.vendor_id().unwrap(), 0x2357);
        assert_eq!(config.usb.product_id().unwrap(), 0x011e);
        assert_eq!(config.engine.max_transfer_size, 2048);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_hex_id() {
        assert_eq!(parse_hex_id("0x2357", "vid").unwrap(), 0x2357);
        assert_eq!(parse_hex_id("0X1e", "pid").unwrap(), 0x001e);
        assert!(parse_hex_id("2357", "vid").is_err());
        assert!(parse_hex_id("0x", "vid").is_err());
        assert!(parse_hex_id("0x12345", "vid").is_err());
        assert!(parse_hex_id("0xGHIJ", "vid").is_err());
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = BridgeConfig::default();
        config.bridge.log_level = "loud".to_string();
        assert!(config.validate().is_err());

        config.bridge.log_level = "trace".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_addresses() {
        let mut config = BridgeConfig::default();
        config.bridge.peer_addr = "localhost".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_engine_section() {
        let mut config = BridgeConfig::default();
        config.engine.tx_queue_low = config.engine.tx_queue_high;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("bridge.toml");

        let mut config = BridgeConfig::default();
        config.bridge.max_restarts = 7;
        config.engine.max_rx_errors = 9;
        config.save(&path).unwrap();

        let loaded = BridgeConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.bridge.max_restarts, 7);
        assert_eq!(loaded.engine, config.engine);
        assert_eq!(loaded.usb.vendor_id, "0x2357");
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bridge.toml");
        fs::write(
            &path,
            r#"
[usb]
vendor_id = "0x0bda"
product_id = "0x8812"

[engine]
tx_queue_high = 32
tx_queue_low = 8
"#,
        )
        .unwrap();

        let config = BridgeConfig::load(Some(path)).unwrap();
        assert_eq!(config.usb.vendor_id().unwrap(), 0x0bda);
        assert_eq!(config.usb.interface, 0);
        assert_eq!(config.engine.tx_queue_high, 32);
        assert_eq!(config.engine.max_transfer_size, 2048);
        assert_eq!(config.bridge.stats_interval_secs, 60);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bridge.toml");
        fs::write(&path, "[usb]\nvendor_id = \"2357\"\n").unwrap();

        assert!(BridgeConfig::load(Some(path)).is_err());
    }

    #[test]
    fn test_expand_path() {
        let path = expand_path("/etc/usbnet-bridge/bridge.toml");
        assert_eq!(path, PathBuf::from("/etc/usbnet-bridge/bridge.toml"));

        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_path("~/bridge.toml"), home.join("bridge.toml"));
        }
    }
}
