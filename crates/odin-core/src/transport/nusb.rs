//! nusb-based USB transport implementation.

use nusb::transfer::{Bulk, In, Out};
use nusb::{Interface, MaybeFuture, list_devices};
use std::io::{Read, Write};
use std::time::Duration;
use tracing::{debug, info, instrument};

use super::traits::{DeviceInfo, TransportError, UsbTransport};
use crate::protocol::constants::{MAX_USB_WRITE, SAMSUNG_VENDOR_ID, SUPPORTED_PIDS};

/// List Samsung devices currently enumerated in download mode.
pub fn enumerate() -> Result<Vec<DeviceInfo>, TransportError> {
    let devices = list_devices()
        .wait()
        .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

    Ok(devices
        .filter(|d| {
            d.vendor_id() == SAMSUNG_VENDOR_ID && SUPPORTED_PIDS.contains(&d.product_id())
        })
        .map(|d| DeviceInfo {
            vendor_id: d.vendor_id(),
            product_id: d.product_id(),
            manufacturer: d.manufacturer_string().map(str::to_owned),
            product: d.product_string().map(str::to_owned),
            serial: d.serial_number().map(str::to_owned),
            protocol_version: 0,
            default_packet_size: 0,
        })
        .collect())
}

/// nusb-based USB transport.
pub struct NusbTransport {
    interface: Interface,
    in_endpoint: u8,
    out_endpoint: u8,
    vid: u16,
    pid: u16,
}

impl NusbTransport {
    /// Open the first device in download mode (tries all supported PIDs).
    #[instrument(level = "info")]
    pub fn open() -> Result<Self, TransportError> {
        let devices = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        for device_info in devices {
            if device_info.vendor_id() == SAMSUNG_VENDOR_ID
                && SUPPORTED_PIDS.contains(&device_info.product_id())
            {
                return Self::open_device_info(device_info);
            }
        }

        Err(TransportError::DeviceNotFound {
            vid: SAMSUNG_VENDOR_ID,
            pid: 0,
        })
    }

    /// Open a device with specific VID/PID.
    #[instrument(level = "info", fields(vid = format!("{:04X}", vid), pid = format!("{:04X}", pid)))]
    pub fn open_with_ids(vid: u16, pid: u16) -> Result<Self, TransportError> {
        let device_info = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .find(|d| d.vendor_id() == vid && d.product_id() == pid)
            .ok_or(TransportError::DeviceNotFound { vid, pid })?;

        Self::open_device_info(device_info)
    }

    fn open_device_info(device_info: nusb::DeviceInfo) -> Result<Self, TransportError> {
        let vid = device_info.vendor_id();
        let pid = device_info.product_id();

        info!(
            vendor_id = %format!("{:04X}", vid),
            product_id = %format!("{:04X}", pid),
            "Found device"
        );

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        // The bulk pair moves between interfaces across bootloader
        // generations, so scan every interface of every configuration.
        let mut found: Option<(u8, u8, u8)> = None;

        'outer: for config in device.configurations() {
            for iface in config.interfaces() {
                let mut in_endpoint: u8 = 0;
                let mut out_endpoint: u8 = 0;
                for alt in iface.alt_settings() {
                    for ep in alt.endpoints() {
                        if ep.transfer_type() == nusb::descriptors::TransferType::Bulk {
                            if ep.direction() == nusb::transfer::Direction::In {
                                in_endpoint = ep.address();
                            } else {
                                out_endpoint = ep.address();
                            }
                        }
                    }
                }
                if in_endpoint != 0 && out_endpoint != 0 {
                    found = Some((iface.interface_number(), in_endpoint, out_endpoint));
                    break 'outer;
                }
            }
        }

        let (iface_number, in_endpoint, out_endpoint) =
            found.ok_or(TransportError::EndpointNotFound)?;

        let interface =
            device
                .claim_interface(iface_number)
                .wait()
                .map_err(|e| TransportError::ClaimInterfaceFailed {
                    interface: iface_number,
                    message: e.to_string(),
                })?;

        info!(
            interface = iface_number,
            in_ep = %format!("0x{:02X}", in_endpoint),
            out_ep = %format!("0x{:02X}", out_endpoint),
            "Device opened successfully"
        );

        Ok(Self {
            interface,
            in_endpoint,
            out_endpoint,
            vid,
            pid,
        })
    }
}

impl UsbTransport for NusbTransport {
    #[instrument(skip(self, data), fields(len = data.len()))]
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        let ep = self
            .interface
            .endpoint::<Bulk, Out>(self.out_endpoint)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

        let mut writer = ep.writer(MAX_USB_WRITE);
        for piece in data.chunks(MAX_USB_WRITE) {
            writer
                .write_all(piece)
                .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        }
        writer
            .flush()
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

        debug!(bytes_written = data.len(), "Write complete");
        Ok(data.len())
    }

    #[instrument(skip(self), fields(max_len))]
    fn read(&self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let ep = self
            .interface
            .endpoint::<Bulk, In>(self.in_endpoint)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;

        let mut reader = ep.reader(max_len.max(512)).with_read_timeout(timeout);
        let mut buf = vec![0u8; max_len];

        let n = reader.read(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                TransportError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                }
            } else {
                TransportError::ReadFailed(e.to_string())
            }
        })?;

        buf.truncate(n);
        debug!(bytes_read = n, "Read complete");
        Ok(buf)
    }

    fn write_zlp(&self) -> Result<(), TransportError> {
        let ep = self
            .interface
            .endpoint::<Bulk, Out>(self.out_endpoint)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

        let mut writer = ep.writer(0);
        writer
            .flush_end()
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        debug!("Zero-length write complete");
        Ok(())
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}
