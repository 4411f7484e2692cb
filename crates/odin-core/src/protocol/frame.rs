//! Command frame builder and reply parser.
//!
//! Every host-to-device command is a fixed 1024-byte little-endian record:
//! `cmd:u32, sub:u32` followed by a context-specific payload, zero-padded.
//! Every device reply is exactly 8 bytes: `cmd_echo:u32, data:u32`.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use thiserror::Error;

use super::constants::{CMD_PACKET_SIZE, CMD_XMIT, REPLY_REFUSED, REPLY_SIZE, XMIT_END};

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("reply truncated: expected {REPLY_SIZE} bytes, got {actual}")]
    ShortReply { actual: usize },
}

/// A 1024-byte command frame.
#[derive(Clone)]
pub struct CmdPacket {
    buf: Box<[u8; CMD_PACKET_SIZE]>,
    payload_len: usize,
}

impl CmdPacket {
    /// Frame carrying only the `(cmd, sub)` header.
    pub fn new(cmd: u32, sub: u32) -> Self {
        let mut buf = Box::new([0u8; CMD_PACKET_SIZE]);
        buf[0..4].copy_from_slice(&cmd.to_le_bytes());
        buf[4..8].copy_from_slice(&sub.to_le_bytes());
        Self {
            buf,
            payload_len: 0,
        }
    }

    /// Frame with a single u32 argument at offset 8.
    pub fn with_u32(cmd: u32, sub: u32, arg: u32) -> Self {
        let mut pkt = Self::new(cmd, sub);
        pkt.buf[8..12].copy_from_slice(&arg.to_le_bytes());
        pkt.payload_len = 4;
        pkt
    }

    /// Frame with a single u64 argument at offset 8 (session byte total).
    pub fn with_u64(cmd: u32, sub: u32, arg: u64) -> Self {
        let mut pkt = Self::new(cmd, sub);
        pkt.buf[8..16].copy_from_slice(&arg.to_le_bytes());
        pkt.payload_len = 8;
        pkt
    }

    /// The `(102, 3)` finalizer committing one chunk to flash.
    ///
    /// Payload at offset 8: `destination=0, actual_bytes, 0, device_type,
    /// partition_id, completion`, where `completion` is 1 only on the last
    /// chunk of a member.
    pub fn file_finalizer(
        actual_bytes: u32,
        device_type: u32,
        partition_id: u32,
        last_chunk: bool,
    ) -> Self {
        let mut pkt = Self::new(CMD_XMIT, XMIT_END);
        let mut cur = Cursor::new(&mut pkt.buf[8..]);
        cur.write_u32::<LittleEndian>(0).unwrap(); // destination: phone
        cur.write_u32::<LittleEndian>(actual_bytes).unwrap();
        cur.write_u32::<LittleEndian>(0).unwrap();
        cur.write_u32::<LittleEndian>(device_type).unwrap();
        cur.write_u32::<LittleEndian>(partition_id).unwrap();
        cur.write_u32::<LittleEndian>(last_chunk as u32).unwrap();
        pkt.payload_len = 24;
        pkt
    }

    /// The full zero-padded 1024-byte frame.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..]
    }

    /// Bytes of the header plus payload, without padding.
    pub fn meaningful_len(&self) -> usize {
        8 + self.payload_len
    }
}

impl std::fmt::Debug for CmdPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cmd = u32::from_le_bytes(self.buf[0..4].try_into().unwrap());
        let sub = u32::from_le_bytes(self.buf[4..8].try_into().unwrap());
        write!(f, "CmdPacket({cmd}, {sub})")
    }
}

/// Parsed 8-byte device reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    pub cmd_echo: u32,
    pub data: u32,
}

impl Reply {
    /// Parse a reply frame. Anything other than exactly 8 bytes is a
    /// framing error.
    pub fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() != REPLY_SIZE {
            return Err(FrameError::ShortReply {
                actual: bytes.len(),
            });
        }
        let mut cur = Cursor::new(bytes);
        Ok(Self {
            cmd_echo: cur.read_u32::<LittleEndian>().unwrap(),
            data: cur.read_u32::<LittleEndian>().unwrap(),
        })
    }

    /// Device-side refusal; `data` carries the device error code.
    pub fn is_refusal(&self) -> bool {
        self.cmd_echo == REPLY_REFUSED
    }

    pub fn to_bytes(self) -> [u8; REPLY_SIZE] {
        let mut buf = [0u8; REPLY_SIZE];
        buf[0..4].copy_from_slice(&self.cmd_echo.to_le_bytes());
        buf[4..8].copy_from_slice(&self.data.to_le_bytes());
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::*;

    #[test]
    fn every_frame_is_1024_bytes() {
        let frames = [
            CmdPacket::new(CMD_END, END_SESSION),
            CmdPacket::with_u32(CMD_SESSION, SESSION_VERSION, SESSION_VERSION_ARG),
            CmdPacket::with_u64(CMD_SESSION, SESSION_TOTAL_BYTES, u64::MAX),
            CmdPacket::file_finalizer(123, 2, 80, true),
        ];
        for f in &frames {
            assert_eq!(f.as_bytes().len(), CMD_PACKET_SIZE);
        }
    }

    #[test]
    fn frame_layout_is_little_endian() {
        let pkt = CmdPacket::with_u32(CMD_SESSION, SESSION_PART_SIZE, 0x10_0000);
        let b = pkt.as_bytes();
        assert_eq!(&b[0..4], &[100, 0, 0, 0]);
        assert_eq!(&b[4..8], &[5, 0, 0, 0]);
        assert_eq!(&b[8..12], &[0, 0, 0x10, 0]);
        assert!(b[12..].iter().all(|&x| x == 0));
    }

    #[test]
    fn u64_payload_at_offset_8() {
        let pkt = CmdPacket::with_u64(CMD_SESSION, SESSION_TOTAL_BYTES, 0x0102_0304_0506_0708);
        assert_eq!(
            &pkt.as_bytes()[8..16],
            &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]
        );
    }

    #[test]
    fn finalizer_layout() {
        let pkt = CmdPacket::file_finalizer(0x1234, 2, 80, false);
        let b = pkt.as_bytes();
        assert_eq!(&b[0..4], &102u32.to_le_bytes());
        assert_eq!(&b[4..8], &3u32.to_le_bytes());
        assert_eq!(&b[8..12], &0u32.to_le_bytes()); // destination
        assert_eq!(&b[12..16], &0x1234u32.to_le_bytes()); // actual bytes
        assert_eq!(&b[16..20], &0u32.to_le_bytes());
        assert_eq!(&b[20..24], &2u32.to_le_bytes()); // device type
        assert_eq!(&b[24..28], &80u32.to_le_bytes()); // partition id
        assert_eq!(&b[28..32], &0u32.to_le_bytes()); // completion
        assert_eq!(pkt.meaningful_len(), 32);

        let last = CmdPacket::file_finalizer(0x1234, 2, 80, true);
        assert_eq!(&last.as_bytes()[28..32], &1u32.to_le_bytes());
    }

    #[test]
    fn reply_roundtrip() {
        let r = Reply {
            cmd_echo: CMD_SESSION,
            data: (3 << 16) | 512,
        };
        let parsed = Reply::parse(&r.to_bytes()).unwrap();
        assert_eq!(parsed, r);
        assert!(!parsed.is_refusal());
    }

    #[test]
    fn short_reply_is_an_error() {
        for n in 0..REPLY_SIZE {
            assert!(Reply::parse(&vec![0u8; n]).is_err());
        }
        assert!(Reply::parse(&[0u8; 9]).is_err());
    }

    #[test]
    fn refusal_detection() {
        let r = Reply::parse(&{
            let mut b = [0u8; 8];
            b[0..4].copy_from_slice(&REPLY_REFUSED.to_le_bytes());
            b[4..8].copy_from_slice(&7u32.to_le_bytes());
            b
        })
        .unwrap();
        assert!(r.is_refusal());
        assert_eq!(r.data, 7);
    }
}
