//! Transport layer module.

pub mod mock;
pub mod nusb;
pub mod traits;

pub use mock::MockTransport;
pub use nusb::{NusbTransport, enumerate};
pub use traits::{DeviceInfo, TransportError, UsbTransport};
