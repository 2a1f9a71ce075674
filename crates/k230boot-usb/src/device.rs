//! K230 USB loader device
//!
//! This module provides the `K230Usb` struct, a raw [`Transport`] over the
//! loader interface: bulk data plus vendor requests on EP0. Wrap it in
//! [`RomBridge`](crate::RomBridge) to run a session on it.

use std::fmt;
use std::time::{Duration, Instant};

use k230boot_core::{Transport, TransportError};
use nusb::transfer::{
    Buffer, Bulk, ControlIn, ControlOut, ControlType, Direction, In, Out, Recipient, TransferError,
};
use nusb::{DeviceInfo, Endpoint, Interface, MaybeFuture};

use crate::error::{Result, UsbError};
use crate::protocol::*;

/// Which device to open
#[derive(Debug, Clone, Default)]
pub struct UsbConfig {
    /// Match on serial number
    pub serial: Option<String>,
    /// Index among matching devices
    pub index: usize,
}

/// Information about a connected loader
#[derive(Debug, Clone)]
pub struct K230DeviceInfo {
    /// USB bus number
    pub bus: u8,
    /// USB device address
    pub address: u8,
    /// Serial number, if the ROM reports one
    pub serial: Option<String>,
    /// Negotiated bus speed
    pub speed: Option<nusb::Speed>,
}

impl fmt::Display for K230DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "K230 boot ROM at bus {} address {}", self.bus, self.address)?;
        if let Some(serial) = &self.serial {
            write!(f, " (serial {})", serial)?;
        }
        if let Some(speed) = self.speed {
            write!(f, " [{:?} speed]", speed)?;
        }
        Ok(())
    }
}

impl From<&DeviceInfo> for K230DeviceInfo {
    fn from(d: &DeviceInfo) -> Self {
        Self {
            bus: d.busnum(),
            address: d.device_address(),
            serial: d.serial_number().map(|s| s.to_string()),
            speed: d.speed(),
        }
    }
}

/// Open connection to the K230 mask-ROM loader
pub struct K230Usb {
    interface: Interface,
    out_ep: Endpoint<Bulk, Out>,
    in_ep: Endpoint<Bulk, In>,
    packet_size: usize,
    info: K230DeviceInfo,
}

impl K230Usb {
    /// Open the first loader found
    pub fn open() -> Result<Self> {
        Self::open_with_config(UsbConfig::default())
    }

    /// Open a loader selected by serial number and index
    pub fn open_with_config(config: UsbConfig) -> Result<Self> {
        let devices: Vec<DeviceInfo> = matching_devices()?
            .filter(|d| match &config.serial {
                Some(serial) => d.serial_number() == Some(serial.as_str()),
                None => true,
            })
            .collect();

        let device_info = devices.get(config.index).ok_or_else(|| match &config.serial {
            Some(serial) => UsbError::SerialNotFound(serial.clone()),
            None => UsbError::DeviceNotFound,
        })?;
        let info = K230DeviceInfo::from(device_info);
        log::info!("Opening {}", info);

        let speed = device_info
            .speed()
            .ok_or_else(|| UsbError::UnsupportedSpeed("unknown".to_string()))?;
        let packet_size =
            packet_size(speed).ok_or_else(|| UsbError::UnsupportedSpeed(format!("{:?}", speed)))?;
        log::debug!("Speed {:?}, max packet size {}", speed, packet_size);

        // The loader exposes a single interface
        let iface_num = device_info
            .interfaces()
            .next()
            .map(|i| i.interface_number())
            .unwrap_or(0);

        let device = device_info
            .open()
            .wait()
            .map_err(|e| UsbError::OpenFailed(e.to_string()))?;

        let config_desc = device
            .active_configuration()
            .map_err(|e| UsbError::OpenFailed(format!("Failed to get config: {}", e)))?;

        let mut in_addr: Option<u8> = None;
        let mut out_addr: Option<u8> = None;
        for iface in config_desc.interface_alt_settings() {
            if iface.interface_number() != iface_num {
                continue;
            }
            for ep in iface.endpoints() {
                if ep.transfer_type() != nusb::descriptors::TransferType::Bulk {
                    continue;
                }
                match ep.direction() {
                    Direction::In => {
                        in_addr.get_or_insert(ep.address());
                    }
                    Direction::Out => {
                        out_addr.get_or_insert(ep.address());
                    }
                }
            }
            break;
        }
        let in_addr = in_addr.ok_or(UsbError::EndpointNotFound("IN"))?;
        let out_addr = out_addr.ok_or(UsbError::EndpointNotFound("OUT"))?;

        log::debug!(
            "Using interface {}, IN EP 0x{:02X}, OUT EP 0x{:02X}",
            iface_num,
            in_addr,
            out_addr
        );

        let interface = claim_interface(&device, iface_num)?;
        let out_ep = interface
            .endpoint::<Bulk, Out>(out_addr)
            .map_err(|e| UsbError::ClaimFailed(e.to_string()))?;
        let in_ep = interface
            .endpoint::<Bulk, In>(in_addr)
            .map_err(|e| UsbError::ClaimFailed(e.to_string()))?;

        Ok(Self {
            interface,
            out_ep,
            in_ep,
            packet_size,
            info,
        })
    }

    /// List all loaders currently in ROM mode
    pub fn list_devices() -> Result<Vec<K230DeviceInfo>> {
        Ok(matching_devices()?.map(|d| K230DeviceInfo::from(&d)).collect())
    }

    /// Information about the opened device
    pub fn info(&self) -> &K230DeviceInfo {
        &self.info
    }

    /// Bulk max packet size
    pub fn packet_size(&self) -> usize {
        self.packet_size
    }
}

fn matching_devices() -> Result<impl Iterator<Item = DeviceInfo>> {
    Ok(nusb::list_devices()
        .wait()
        .map_err(|e| UsbError::OpenFailed(e.to_string()))?
        .filter(|d| d.vendor_id() == KENDRYTE_USB_VENDOR && d.product_id() == K230_ROM_USB_PRODUCT))
}

/// Claim the loader interface, retrying while the OS releases it
fn claim_interface(device: &nusb::Device, iface_num: u8) -> Result<Interface> {
    let deadline = Instant::now() + CLAIM_TIMEOUT;
    loop {
        match device.claim_interface(iface_num).wait() {
            Ok(interface) => return Ok(interface),
            Err(e) if Instant::now() < deadline => {
                log::trace!("Claim of interface {} failed ({}), retrying", iface_num, e);
                std::thread::sleep(CLAIM_RETRY_INTERVAL);
            }
            Err(e) => return Err(UsbError::ClaimFailed(e.to_string())),
        }
    }
}

fn map_transfer_error(e: TransferError) -> TransportError {
    match e {
        // transfer_blocking cancels the transfer when its timeout expires
        TransferError::Cancelled => TransportError::Timeout,
        TransferError::Disconnected => TransportError::Disconnected,
        TransferError::Stall => TransportError::Stall,
        other => TransportError::Other(other.to_string()),
    }
}

impl Transport for K230Usb {
    fn bulk_out(&mut self, data: &[u8], timeout: Duration) -> std::result::Result<(), TransportError> {
        let mut buf = Buffer::new(data.len());
        buf.extend_from_slice(data);

        self.out_ep
            .transfer_blocking(buf, timeout)
            .into_result()
            .map_err(map_transfer_error)?;

        log::trace!("USB write {} bytes", data.len());
        Ok(())
    }

    fn bulk_in(
        &mut self,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> std::result::Result<usize, TransportError> {
        let max_packet_size = self.in_ep.max_packet_size();
        // Request length must be multiple of max packet size
        let request_len = buffer.len().div_ceil(max_packet_size).max(1) * max_packet_size;
        let mut in_buf = Buffer::new(request_len);
        in_buf.set_requested_len(request_len);

        let data = self
            .in_ep
            .transfer_blocking(in_buf, timeout)
            .into_result()
            .map_err(map_transfer_error)?;

        let received = std::cmp::min(data.len(), buffer.len());
        buffer[..received].copy_from_slice(&data[..received]);

        log::trace!("USB read {} bytes", received);
        Ok(received)
    }

    fn control_out(
        &mut self,
        request: u8,
        arg: u32,
        data: &[u8],
        timeout: Duration,
    ) -> std::result::Result<(), TransportError> {
        let (value, index) = split_arg(arg);
        log::trace!(
            "USB control out request 0x{:02X} value 0x{:04X} index 0x{:04X}",
            request,
            value,
            index
        );
        self.interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request,
                    value,
                    index,
                    data,
                },
                timeout,
            )
            .wait()
            .map_err(map_transfer_error)
    }

    fn control_in(
        &mut self,
        request: u8,
        arg: u32,
        buf: &mut [u8],
        timeout: Duration,
    ) -> std::result::Result<usize, TransportError> {
        let (value, index) = split_arg(arg);
        let length = u16::try_from(buf.len()).unwrap_or(u16::MAX);
        let data = self
            .interface
            .control_in(
                ControlIn {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request,
                    value,
                    index,
                    length,
                },
                timeout,
            )
            .wait()
            .map_err(map_transfer_error)?;

        let received = std::cmp::min(data.len(), buf.len());
        buf[..received].copy_from_slice(&data[..received]);
        log::trace!(
            "USB control in request 0x{:02X} value 0x{:04X} index 0x{:04X}: {} bytes",
            request,
            value,
            index,
            received
        );
        Ok(received)
    }

    fn max_transfer_size(&self) -> usize {
        self.packet_size * PACKETS_PER_TRANSFER
    }
}
