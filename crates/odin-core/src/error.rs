//! Top-level error type for session, transfer, and orchestration.
//!
//! Module-level errors (`TransportError`, `PitError`, `ArchiveError`,
//! `Lz4Error`) fold into `FlashError` at the session boundary. Every
//! variant is terminal for the session. The few tolerated failures
//! never surface here: the PIT size read gets one retry, zero-length
//! writes are cosmetic, and a missing reply after the final finalizer
//! or the reboot command is expected link behavior.

use thiserror::Error;

use crate::archive::ArchiveError;
use crate::decompress::{DecompressError, Lz4Error};
use crate::pit::PitError;
use crate::session::SessionPhase;
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum FlashError {
    #[error("no device in download mode found")]
    NoDevice,

    #[error("no active session")]
    NotConnected,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("timeout during {phase}")]
    Timeout {
        phase: SessionPhase,
        #[source]
        source: TransportError,
    },

    #[error("handshake failed, device answered {answer:02X?}")]
    HandshakeFailed { answer: Vec<u8> },

    #[error("reply mismatch: expected command {expected}, got {got_cmd} (data 0x{got_data:08X})")]
    ProtocolMismatch {
        expected: u32,
        got_cmd: u32,
        got_data: u32,
    },

    #[error("device refused the request with code 0x{code:08X}")]
    Refused { code: u32 },

    #[error(transparent)]
    Frame(#[from] crate::protocol::FrameError),

    #[error("invalid PIT: {0}")]
    InvalidPit(#[from] PitError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Decompression(#[from] DecompressError),

    #[error("declared {declared} bytes at session open but transferred {actual}")]
    ByteAccounting { declared: u64, actual: u64 },

    #[error("device rejected chunk for partition {partition_id} with code 0x{code:08X}")]
    TransferRejected { code: u32, partition_id: u32 },

    #[error("operation requires phase {required}, session is {actual}")]
    Phase {
        required: SessionPhase,
        actual: SessionPhase,
    },

    #[error("illegal phase transition {from} -> {to}")]
    Transition {
        from: SessionPhase,
        to: SessionPhase,
    },

    #[error("cancelled at chunk boundary")]
    Cancelled,
}

impl From<Lz4Error> for FlashError {
    fn from(e: Lz4Error) -> Self {
        FlashError::Decompression(DecompressError::Lz4(e))
    }
}

impl FlashError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FlashError::Timeout { .. })
    }
}
