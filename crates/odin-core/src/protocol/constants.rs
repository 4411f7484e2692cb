//! Protocol constants for the Samsung Odin/Loke download mode.

use std::time::Duration;

// ============================================================================
// Device Identification
// ============================================================================

/// Samsung Electronics Vendor ID
pub const SAMSUNG_VENDOR_ID: u16 = 0x04E8;

/// Download-mode Product ID (most Galaxy devices)
pub const DOWNLOAD_PRODUCT_ID: u16 = 0x685D;
/// Download-mode Product ID (alternate enumeration)
pub const DOWNLOAD_ALT_PID: u16 = 0x68C3;

/// All supported PIDs for device discovery
pub const SUPPORTED_PIDS: &[u16] = &[DOWNLOAD_PRODUCT_ID, DOWNLOAD_ALT_PID];

// ============================================================================
// Handshake
// ============================================================================

/// Host hello, written verbatim at the start of every session
pub const HANDSHAKE_HELLO: &[u8; 4] = b"ODIN";
/// Expected device answer prefix
pub const HANDSHAKE_ACK: &[u8; 4] = b"LOKE";

// ============================================================================
// Command Groups (first u32 of every command frame)
// ============================================================================

/// Session control (version query, part size, total bytes)
pub const CMD_SESSION: u32 = 100;
/// PIT transfer (dump and flash)
pub const CMD_PIT: u32 = 101;
/// File transfer
pub const CMD_XMIT: u32 = 102;
/// End of session / reboot
pub const CMD_END: u32 = 103;

/// A reply whose echo field carries this value is a device-side refusal;
/// the data field then holds the device error code.
pub const REPLY_REFUSED: u32 = 0xFFFF_FFFF;

// Session sub-commands
pub const SESSION_VERSION: u32 = 0;
pub const SESSION_TOTAL_BYTES: u32 = 2;
pub const SESSION_PART_SIZE: u32 = 5;

/// Payload of the version query frame
pub const SESSION_VERSION_ARG: u32 = 4;
/// Part size requested when the device advertises a preferred packet size
pub const SESSION_PART_SIZE_ARG: u32 = 0x10_0000;

// PIT sub-commands
pub const PIT_FLASH: u32 = 0;
pub const PIT_DUMP: u32 = 1;
pub const PIT_PART: u32 = 2;
pub const PIT_END: u32 = 3;

// File transfer sub-commands
pub const XMIT_FLASH: u32 = 0;
pub const XMIT_PART: u32 = 2;
pub const XMIT_END: u32 = 3;

// End sub-commands
pub const END_SESSION: u32 = 0;
pub const END_REBOOT: u32 = 1;

// ============================================================================
// Size Constants
// ============================================================================

/// Every command frame is exactly this long, zero-padded.
pub const CMD_PACKET_SIZE: usize = 1024;
/// Every reply frame is exactly this long.
pub const REPLY_SIZE: usize = 8;

/// File transfer block size; each block is acknowledged individually.
pub const FILE_BLOCK_SIZE: usize = 128 * 1024;
/// Upper bound of one transfer chunk, bounded by one (102,2)/(102,3) pair.
pub const MAX_CHUNK_SIZE: usize = 30 * 1024 * 1024;
/// Accumulation buffer for streamed members; flushed as one chunk when full.
pub const SEND_BUFFER_SIZE: usize = MAX_CHUNK_SIZE;

/// Bulk writes above this are split by the transport.
pub const MAX_USB_WRITE: usize = 64 * 1024;

/// Largest PIT the device may announce.
pub const PIT_SIZE_LIMIT: u32 = 0x10_0000;
/// Bytes requested per (101,2) iteration while dumping the PIT.
pub const PIT_READ_CHUNK: usize = 500;
/// PIT upload chunk size.
pub const PIT_FLASH_CHUNK: usize = 1024 * 1024;

/// Members at most this large after decompression may be staged in memory;
/// anything bigger must flow through the streaming decoders.
pub const IN_MEMORY_LIMIT: u64 = 4 * 1024 * 1024 * 1024;

// ============================================================================
// Timing
// ============================================================================

/// Ordinary command/acknowledge round trip.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);
/// The device commits a chunk to flash before answering the finalizer.
pub const FINALIZER_TIMEOUT: Duration = Duration::from_secs(120);
/// Device preparation window after a (102,2) chunk announcement.
pub const CHUNK_PREP_DELAY: Duration = Duration::from_millis(100);
/// Minimum spacing of progress callbacks.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);
