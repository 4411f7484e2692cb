//! Protocol module - Odin wire format definitions.

pub mod constants;
pub mod frame;

pub use constants::*;
pub use frame::{CmdPacket, FrameError, Reply};
