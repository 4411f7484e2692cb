//! USB Transport layer abstraction.
//!
//! Defines the `UsbTransport` trait for the download-mode bulk endpoint
//! pair, allowing different implementations (nusb, mock, etc.).

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: VID={vid:04X} PID={pid:04X}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Bulk endpoint pair not found")]
    EndpointNotFound,

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }
}

/// Identity of a device in download mode.
///
/// Created at enumeration; `protocol_version` and `default_packet_size`
/// are filled in after the version query.
#[derive(Debug, Clone, Default)]
pub struct DeviceInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial: Option<String>,
    pub protocol_version: u16,
    pub default_packet_size: u16,
}

/// Abstract USB transport interface.
///
/// This trait enables:
/// - Production implementation using nusb
/// - Mock implementation for unit testing
pub trait UsbTransport: Send {
    /// Write raw bytes to the OUT endpoint. Implementations split writes
    /// larger than `MAX_USB_WRITE` into multiple bulk transfers.
    fn write(&self, data: &[u8]) -> Result<usize, TransportError>;

    /// Read up to `max_len` bytes from the IN endpoint. Short reads are
    /// allowed; exceeding `timeout` yields `TransportError::Timeout`.
    fn read(&self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Zero-length bulk-out transfer, used as a synchronization marker
    /// around data blocks and finalizers.
    fn write_zlp(&self) -> Result<(), TransportError>;

    /// Get the current VID.
    fn vendor_id(&self) -> u16;

    /// Get the current PID.
    fn product_id(&self) -> u16;
}
