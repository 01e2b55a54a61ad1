//! usbnet-bridge
//!
//! Drives a USB network adapter's bulk endpoints through the transfer engine
//! and exchanges the packets with a UDP peer standing in for the host network
//! stack.

mod config;
mod link;
mod usb;

use anyhow::{Context, Result, anyhow, bail};
use bytes::Bytes;
use clap::Parser;
use common::setup_logging;
use config::BridgeConfig;
use engine::{EnqueueStatus, Engine, EngineStatus, RxState, StopReason, Transport};
use link::WatchCongestion;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::signal;
use tracing::{debug, error, info, warn};
use usb::{RadioDevice, UsbTransport};

/// Largest datagram accepted from the peer
const MAX_DATAGRAM: usize = 65_536;

/// How often the supervisor checks the receive loop
const HEALTH_INTERVAL: Duration = Duration::from_millis(500);

/// Pause before restarting a failed session
const RESTART_DELAY: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "usbnet-bridge")]
#[command(
    author,
    version,
    about = "Bridge a USB network adapter's bulk endpoints to a UDP peer"
)]
#[command(long_about = "
Moves packets between a USB network adapter and a UDP peer. Datagrams from
the peer are transmitted on the adapter's bulk OUT endpoint; packets received
on the bulk IN endpoint are forwarded to the peer.

EXAMPLES:
    # Run with default config
    usbnet-bridge

    # Run with custom config
    usbnet-bridge --config /path/to/bridge.toml

    # List USB devices and exit
    usbnet-bridge --list-devices

    # Override the UDP endpoints
    usbnet-bridge --bind 0.0.0.0:7401 --peer 192.168.1.20:7402

CONFIGURATION:
    The bridge looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usbnet-bridge/bridge.toml
    3. /etc/usbnet-bridge/bridge.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Local UDP address (overrides config)
    #[arg(long, value_name = "ADDR")]
    bind: Option<String>,

    /// UDP peer address (overrides config)
    #[arg(long, value_name = "ADDR")]
    peer: Option<String>,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Shutdown,
    DeviceGone,
    ReceiveFailed,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = BridgeConfig::default();
        let path = BridgeConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        BridgeConfig::load(Some(config::expand_path(path)))
            .context("Failed to load configuration")?
    } else {
        BridgeConfig::load_or_default()
    };

    if let Some(bind) = args.bind {
        config.bridge.bind_addr = bind;
    }
    if let Some(peer) = args.peer {
        config.bridge.peer_addr = peer;
    }

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.bridge.log_level);

    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usbnet-bridge v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    config.validate().context("Invalid configuration")?;

    let context = rusb::Context::new().context("Failed to initialize libusb")?;

    if args.list_devices {
        return list_devices_mode(&context, &config);
    }

    run(config, context).await
}

/// List USB devices and exit
fn list_devices_mode(context: &rusb::Context, config: &BridgeConfig) -> Result<()> {
    let vendor_id = config.usb.vendor_id()?;
    let product_id = config.usb.product_id()?;
    let devices = usb::list_devices(context)?;

    if devices.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", devices.len());
    for device in devices {
        let marker = if device.vendor_id == vendor_id && device.product_id == product_id {
            "*"
        } else {
            " "
        };
        println!(
            "  {} Bus {:03} Device {:03}: {:04x}:{:04x} {}",
            marker,
            device.bus_number,
            device.address,
            device.vendor_id,
            device.product_id,
            device.product.as_deref().unwrap_or("Unknown Product")
        );
    }
    println!("\n  * = configured adapter ({:04x}:{:04x})", vendor_id, product_id);

    Ok(())
}

/// Open the adapter and supervise engine sessions until shutdown
async fn run(config: BridgeConfig, context: rusb::Context) -> Result<()> {
    let socket = UdpSocket::bind(&config.bridge.bind_addr)
        .await
        .with_context(|| format!("Failed to bind UDP socket to {}", config.bridge.bind_addr))?;
    socket
        .connect(&config.bridge.peer_addr)
        .await
        .with_context(|| format!("Failed to connect UDP socket to {}", config.bridge.peer_addr))?;
    info!(
        "Bridging {} <-> {}",
        config.bridge.bind_addr, config.bridge.peer_addr
    );

    let device = RadioDevice::open(
        &context,
        config.usb.vendor_id()?,
        config.usb.product_id()?,
        config.usb.interface,
    )?;
    let endpoints = device.endpoints();
    let lanes: Vec<u8> = endpoints
        .inbound
        .into_iter()
        .chain(endpoints.outbound)
        .collect();
    let transport: Arc<dyn Transport> = Arc::new(
        UsbTransport::new(device.handle(), &lanes, config.usb.poll_timeout())
            .context("Failed to start USB transfer threads")?,
    );

    let mut restarts = 0;
    loop {
        let end = run_session(&config, Arc::clone(&transport), endpoints, &socket).await?;

        match end {
            SessionEnd::Shutdown => break,
            SessionEnd::DeviceGone => {
                error!("Adapter disconnected");
                return Err(anyhow!("USB device disconnected"));
            }
            SessionEnd::ReceiveFailed => {
                restarts += 1;
                if restarts > config.bridge.max_restarts {
                    bail!("Receive loop failed {} times, giving up", restarts);
                }
                warn!(
                    "Restarting engine session ({}/{})",
                    restarts, config.bridge.max_restarts
                );
                tokio::time::sleep(RESTART_DELAY).await;
            }
        }
    }

    info!("Bridge shutdown complete");
    Ok(())
}

/// Run one engine session, pumping packets until it ends
async fn run_session(
    config: &BridgeConfig,
    transport: Arc<dyn Transport>,
    endpoints: engine::Endpoints,
    socket: &UdpSocket,
) -> Result<SessionEnd> {
    let (sink, uplink) = link::uplink(config.bridge.uplink_capacity);
    let congestion = Arc::new(WatchCongestion::new());
    let mut paused = congestion.subscribe();

    let engine = Arc::new(
        Engine::start(
            transport,
            endpoints,
            config.engine.clone(),
            sink.clone(),
            congestion.clone(),
        )
        .context("Failed to start engine")?,
    );

    let stats_enabled = config.bridge.stats_interval_secs > 0;
    let mut stats_ticker =
        tokio::time::interval(Duration::from_secs(config.bridge.stats_interval_secs.max(1)));
    stats_ticker.tick().await;
    let mut health = tokio::time::interval(HEALTH_INTERVAL);

    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut datagram = vec![0u8; MAX_DATAGRAM];

    let end = loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    error!("Error waiting for Ctrl+C: {}", e);
                }
                info!("Received Ctrl+C, shutting down gracefully...");
                break SessionEnd::Shutdown;
            }

            result = recv_when_clear(socket, &mut datagram, &mut paused) => match result {
                Ok(len) => {
                    let packet = Bytes::copy_from_slice(&datagram[..len]);
                    if let EnqueueStatus::Rejected(reason) = engine.enqueue(packet) {
                        debug!("Outbound packet rejected: {:?}", reason);
                    }
                }
                Err(e) => warn!("UDP receive failed: {}", e),
            },

            Some(packet) = uplink.recv() => {
                if let Err(e) = socket.send(&packet).await {
                    debug!("UDP send failed: {}", e);
                }
            }

            _ = stats_ticker.tick(), if stats_enabled => {
                log_status(&engine.status(), sink.dropped());
            }

            _ = health.tick() => match engine.status().rx {
                RxState::Stopped(StopReason::DeviceGone) => break SessionEnd::DeviceGone,
                RxState::Stopped(StopReason::TooManyErrors) => break SessionEnd::ReceiveFailed,
                _ => {}
            },
        }
    };

    // stop() blocks until the transfer threads hand back every slot
    let stopper = Arc::clone(&engine);
    let stats = tokio::task::spawn_blocking(move || stopper.stop())
        .await
        .context("Engine stop task failed")?;

    info!(
        "Session ended ({:?}): tx {} packets / {} bytes, rx {} packets / {} bytes",
        end, stats.tx_packets, stats.tx_bytes, stats.rx_packets, stats.rx_bytes
    );
    Ok(end)
}

/// Receive the next datagram once the engine is accepting again
async fn recv_when_clear(
    socket: &UdpSocket,
    buf: &mut [u8],
    paused: &mut tokio::sync::watch::Receiver<bool>,
) -> std::io::Result<usize> {
    link::wait_clear(paused).await;
    socket.recv(buf).await
}

fn log_status(status: &EngineStatus, uplink_dropped: u64) {
    let stats = &status.stats;
    info!(
        "rx {} pkts ({} errors, {} dropped, {} uplink drops), tx {} pkts ({} errors, {} dropped), queued {}{}",
        stats.rx_packets,
        stats.rx_errors,
        stats.rx_dropped,
        uplink_dropped,
        stats.tx_packets,
        stats.tx_errors,
        stats.tx_dropped,
        status.queued,
        if status.congested { " (congested)" } else { "" }
    );

    if status.rx_consecutive_errors > 0 {
        warn!(
            "Receive loop has {} consecutive errors",
            status.rx_consecutive_errors
        );
    }
}
