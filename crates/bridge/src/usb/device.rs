//! Radio device discovery and ownership
//!
//! Opens the adapter by VID:PID, takes the data interface away from any kernel
//! driver and resolves its bulk endpoints. The interface is released (and the
//! kernel driver reattached) when the [`RadioDevice`] is dropped.

use anyhow::{Context as _, Result, anyhow};
use engine::Endpoints;
use rusb::{Context, Device, DeviceHandle, Direction, TransferType, UsbContext};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Summary line for `--list-devices`
#[derive(Debug, Clone)]
pub struct DeviceSummary {
    pub bus_number: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub product: Option<String>,
}

/// Enumerate every USB device visible to the context
pub fn list_devices(context: &Context) -> Result<Vec<DeviceSummary>> {
    let devices = context.devices().context("Failed to enumerate USB devices")?;

    let mut summaries = Vec::new();
    for device in devices.iter() {
        let descriptor = match device.device_descriptor() {
            Ok(d) => d,
            Err(e) => {
                debug!("Skipping device without descriptor: {}", e);
                continue;
            }
        };

        let product = device.open().ok().and_then(|handle| {
            descriptor
                .product_string_index()
                .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok())
        });

        summaries.push(DeviceSummary {
            bus_number: device.bus_number(),
            address: device.address(),
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
            product,
        });
    }

    Ok(summaries)
}

/// First bulk IN and first bulk OUT endpoint, in descriptor order
pub fn pick_bulk_endpoints(
    descriptors: impl IntoIterator<Item = (u8, Direction, TransferType)>,
) -> Endpoints {
    let mut endpoints = Endpoints::default();

    for (address, direction, transfer_type) in descriptors {
        if transfer_type != TransferType::Bulk {
            continue;
        }
        match direction {
            Direction::In if endpoints.inbound.is_none() => endpoints.inbound = Some(address),
            Direction::Out if endpoints.outbound.is_none() => endpoints.outbound = Some(address),
            _ => {}
        }
    }

    endpoints
}

/// An opened adapter with its data interface claimed
pub struct RadioDevice {
    handle: Arc<DeviceHandle<Context>>,
    interface: u8,
    endpoints: Endpoints,
    driver_detached: bool,
}

impl RadioDevice {
    /// Open the first device matching `vendor_id:product_id`
    pub fn open(
        context: &Context,
        vendor_id: u16,
        product_id: u16,
        interface: u8,
    ) -> Result<Self> {
        let device = find_device(context, vendor_id, product_id)?;
        let endpoints = discover_endpoints(&device, interface)?;

        let handle = device.open().map_err(|e| match e {
            rusb::Error::Access => anyhow!(
                "Permission denied opening {:04x}:{:04x} (check udev rules)",
                vendor_id,
                product_id
            ),
            _ => anyhow!("Failed to open {:04x}:{:04x}: {}", vendor_id, product_id, e),
        })?;

        let mut driver_detached = false;
        match handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!("Detaching kernel driver from interface {}", interface);
                handle.detach_kernel_driver(interface).with_context(|| {
                    format!("Failed to detach kernel driver from interface {}", interface)
                })?;
                driver_detached = true;
            }
            Ok(false) => debug!("No kernel driver active on interface {}", interface),
            Err(e) => debug!(
                "Could not check kernel driver status for interface {}: {}",
                interface, e
            ),
        }

        handle
            .claim_interface(interface)
            .with_context(|| format!("Failed to claim interface {}", interface))?;

        info!(
            "Opened {:04x}:{:04x} on bus {:03} device {:03}, interface {}",
            vendor_id,
            product_id,
            device.bus_number(),
            device.address(),
            interface
        );

        Ok(Self {
            handle: Arc::new(handle),
            interface,
            endpoints,
            driver_detached,
        })
    }

    pub fn endpoints(&self) -> Endpoints {
        self.endpoints
    }

    /// Shared handle for the transfer threads
    pub fn handle(&self) -> Arc<DeviceHandle<Context>> {
        Arc::clone(&self.handle)
    }
}

impl Drop for RadioDevice {
    fn drop(&mut self) {
        if let Err(e) = self.handle.release_interface(self.interface) {
            debug!("Failed to release interface {}: {}", self.interface, e);
        }

        if self.driver_detached {
            match self.handle.attach_kernel_driver(self.interface) {
                Ok(()) => debug!("Reattached kernel driver to interface {}", self.interface),
                Err(e) => warn!(
                    "Could not reattach kernel driver to interface {}: {}",
                    self.interface, e
                ),
            }
        }
    }
}

fn find_device(context: &Context, vendor_id: u16, product_id: u16) -> Result<Device<Context>> {
    let devices = context.devices().context("Failed to enumerate USB devices")?;

    devices
        .iter()
        .find(|device| {
            device
                .device_descriptor()
                .map(|d| d.vendor_id() == vendor_id && d.product_id() == product_id)
                .unwrap_or(false)
        })
        .ok_or_else(|| anyhow!("No USB device {:04x}:{:04x} found", vendor_id, product_id))
}

/// Bulk endpoints of the interface's first alternate setting
fn discover_endpoints(device: &Device<Context>, interface: u8) -> Result<Endpoints> {
    let config = device
        .active_config_descriptor()
        .context("Failed to read active config descriptor")?;

    let setting = config
        .interfaces()
        .find(|i| i.number() == interface)
        .and_then(|i| i.descriptors().next())
        .ok_or_else(|| anyhow!("Interface {} not present in active configuration", interface))?;

    let endpoints = pick_bulk_endpoints(
        setting
            .endpoint_descriptors()
            .map(|ep| (ep.address(), ep.direction(), ep.transfer_type())),
    );

    debug!(
        "Interface {}: bulk in {:?}, bulk out {:?}",
        interface, endpoints.inbound, endpoints.outbound
    );
    Ok(endpoints)
}
