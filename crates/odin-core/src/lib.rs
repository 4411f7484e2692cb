//! Odin-Core: Samsung Odin/Loke flashing protocol in Rust.
//!
//! This crate drives a Samsung device in Download Mode over its USB
//! bulk endpoint pair: it parses a firmware distribution (TAR, nested
//! TARs, LZ4/GZIP members), matches members against the device's
//! Partition Information Table, and streams each one to flash through
//! the framed command protocol.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: constants, 1024-byte command frames, 8-byte replies
//! - **Transport**: USB communication abstraction (nusb, mock)
//! - **Pit**: partition table codec
//! - **Archive**: streaming TAR scanning and the firmware model
//! - **Decompress**: streaming LZ4 frame decoding, GZIP via flate2
//! - **Matcher**: member name to partition resolution
//! - **Session**: phase machine and the framed conversation
//! - **Transfer**: chunk/block upload pipeline
//! - **Flasher**: high-level orchestrator
//! - **Events**: observer pattern for UI decoupling
//!
//! # Example
//!
//! ```no_run
//! use odin_core::flasher::Flasher;
//!
//! let mut flasher = Flasher::new();
//! flasher.connect().expect("no device in download mode");
//! let mut firmware = flasher
//!     .load_firmware(Box::new(
//!         std::fs::File::open("firmware.tar.md5").expect("open"),
//!     ))
//!     .expect("parse firmware");
//! flasher
//!     .flash(&mut firmware, None, true)
//!     .expect("flash failed");
//! ```

pub mod archive;
pub mod decompress;
pub mod error;
pub mod events;
pub mod flasher;
pub mod matcher;
pub mod pit;
pub mod protocol;
pub mod session;
pub mod transfer;
pub mod transport;

// Re-exports for convenience
pub use archive::{Compression, Firmware, Member};
pub use error::FlashError;
pub use events::{FlashEvent, FlashObserver, LogLevel, NullObserver, TracingObserver};
pub use flasher::{FlashConfig, FlashSummary, Flasher};
pub use matcher::PartitionTarget;
pub use pit::{Pit, PitEntry};
pub use session::{OdinSession, SessionPhase};
pub use transfer::CancelToken;
pub use transport::{DeviceInfo, MockTransport, NusbTransport, TransportError, UsbTransport};
