//! Streaming LZ4 frame decoder.
//!
//! Decodes the standard LZ4 frame format block by block. Callers pull
//! decompressed blocks with `next_block`; no buffer proportional to the
//! whole stream is ever held, which is what lets multi-gigabyte members
//! flow through a bounded pipeline.
//!
//! Block and content checksums, when flagged, are consumed but not
//! validated.

use std::io::Read;
use thiserror::Error;

/// Frame magic, little-endian on the wire.
pub const LZ4_MAGIC: u32 = 0x184D_2204;
/// Largest block size the frame format can declare (BD code 7).
pub const MAX_BLOCK_SIZE: usize = 4 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum Lz4Error {
    #[error("bad frame magic 0x{actual:08X} at byte {position}")]
    BadMagic { position: u64, actual: u32 },

    #[error("unsupported frame version in FLG byte 0x{flg:02X}")]
    UnsupportedVersion { flg: u8 },

    #[error("reserved block-size code {code} in BD byte")]
    BadBlockSizeCode { code: u8 },

    #[error("block at byte {position} declares {declared} bytes, above the 4 MiB ceiling")]
    OversizedBlock { position: u64, declared: usize },

    #[error("truncated stream at byte {position}")]
    Truncated { position: u64 },

    #[error("invalid sequence at byte {position}: {reason}")]
    InvalidSequence { position: u64, reason: &'static str },

    #[error("EndMark before any data at byte {position}")]
    EndMarkBeforeData { position: u64 },

    #[error("IO error at byte {position}: {source}")]
    Io {
        position: u64,
        source: std::io::Error,
    },
}

/// Parsed frame descriptor.
#[derive(Debug, Clone, Copy)]
pub struct FrameInfo {
    pub content_size: Option<u64>,
    pub block_checksums: bool,
    pub content_checksum: bool,
    pub block_independence: bool,
    pub max_block_size: usize,
}

/// Input reader with a running byte position for error reporting.
struct Counted<R: Read> {
    inner: R,
    pos: u64,
}

impl<R: Read> Counted<R> {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Lz4Error> {
        match self.inner.read_exact(buf) {
            Ok(()) => {
                self.pos += buf.len() as u64;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(Lz4Error::Truncated { position: self.pos })
            }
            Err(e) => Err(Lz4Error::Io {
                position: self.pos,
                source: e,
            }),
        }
    }

    fn read_u8(&mut self) -> Result<u8, Lz4Error> {
        let mut b = [0u8; 1];
        self.read_exact(&mut b)?;
        Ok(b[0])
    }

    fn read_u32_le(&mut self) -> Result<u32, Lz4Error> {
        let mut b = [0u8; 4];
        self.read_exact(&mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    fn read_u64_le(&mut self) -> Result<u64, Lz4Error> {
        let mut b = [0u8; 8];
        self.read_exact(&mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    fn skip(&mut self, n: usize) -> Result<(), Lz4Error> {
        let mut remaining = n;
        let mut scratch = [0u8; 16];
        while remaining > 0 {
            let take = remaining.min(scratch.len());
            self.read_exact(&mut scratch[..take])?;
            remaining -= take;
        }
        Ok(())
    }
}

/// Pull-stream of decompressed blocks over one LZ4 frame.
pub struct Lz4FrameDecoder<R: Read> {
    input: Counted<R>,
    info: FrameInfo,
    /// Decoded bytes of the block most recently returned.
    out: Vec<u8>,
    produced: u64,
    finished: bool,
}

impl<R: Read> Lz4FrameDecoder<R> {
    /// Read and validate the frame header.
    pub fn new(reader: R) -> Result<Self, Lz4Error> {
        let mut input = Counted {
            inner: reader,
            pos: 0,
        };

        let magic = input.read_u32_le()?;
        if magic != LZ4_MAGIC {
            return Err(Lz4Error::BadMagic {
                position: 0,
                actual: magic,
            });
        }

        let flg = input.read_u8()?;
        if (flg >> 6) & 0b11 != 0b01 {
            return Err(Lz4Error::UnsupportedVersion { flg });
        }
        let block_independence = flg & 0x20 != 0;
        let block_checksums = flg & 0x10 != 0;
        let has_content_size = flg & 0x08 != 0;
        let content_checksum = flg & 0x04 != 0;
        let has_dict_id = flg & 0x01 != 0;

        let bd = input.read_u8()?;
        let code = (bd >> 4) & 0b111;
        let max_block_size = match code {
            4 => 64 * 1024,
            5 => 256 * 1024,
            6 => 1024 * 1024,
            7 => MAX_BLOCK_SIZE,
            _ => return Err(Lz4Error::BadBlockSizeCode { code }),
        };

        let content_size = if has_content_size {
            Some(input.read_u64_le()?)
        } else {
            None
        };
        if has_dict_id {
            input.skip(4)?;
        }
        // Header checksum byte, consumed but not validated.
        input.read_u8()?;

        Ok(Self {
            input,
            info: FrameInfo {
                content_size,
                block_checksums,
                content_checksum,
                block_independence,
                max_block_size,
            },
            out: Vec::new(),
            produced: 0,
            finished: false,
        })
    }

    pub fn info(&self) -> &FrameInfo {
        &self.info
    }

    /// Total decompressed bytes delivered so far.
    pub fn produced(&self) -> u64 {
        self.produced
    }

    /// Decode the next block. `None` after the EndMark.
    pub fn next_block(&mut self) -> Result<Option<&[u8]>, Lz4Error> {
        if self.finished {
            return Ok(None);
        }

        let word_pos = self.input.pos;
        let word = self.input.read_u32_le()?;
        if word == 0 {
            // EndMark
            if self.produced == 0 {
                return Err(Lz4Error::EndMarkBeforeData { position: word_pos });
            }
            if self.info.content_checksum {
                self.input.skip(4)?;
            }
            self.finished = true;
            return Ok(None);
        }

        let stored = word & 0x8000_0000 != 0;
        let wire_len = (word & 0x7FFF_FFFF) as usize;
        if wire_len > self.info.max_block_size {
            return Err(Lz4Error::OversizedBlock {
                position: word_pos,
                declared: wire_len,
            });
        }

        let block_pos = self.input.pos;
        let mut compressed = vec![0u8; wire_len];
        self.input.read_exact(&mut compressed)?;
        if self.info.block_checksums {
            self.input.skip(4)?;
        }

        self.out = if stored {
            compressed
        } else {
            let mut decoded = Vec::with_capacity(wire_len.min(self.info.max_block_size));
            decode_block(&compressed, &mut decoded, block_pos, self.info.max_block_size)?;
            decoded
        };
        self.produced += self.out.len() as u64;
        Ok(Some(&self.out))
    }
}

/// Decode one LZ4 block: token nibbles for literal/match lengths, 2-byte
/// little-endian match offsets, LSIC extension bytes.
///
/// Match offsets must satisfy `0 < offset <= out.len()`; the block is
/// decoded independently of its predecessors.
pub(crate) fn decode_block(
    input: &[u8],
    out: &mut Vec<u8>,
    position: u64,
    max_out: usize,
) -> Result<(), Lz4Error> {
    let mut ip = 0usize;

    while ip < input.len() {
        let token = input[ip];
        ip += 1;

        let mut literal_len = (token >> 4) as usize;
        if literal_len == 15 {
            literal_len += read_lsic(input, &mut ip, position)?;
        }
        if ip + literal_len > input.len() {
            return Err(Lz4Error::InvalidSequence {
                position,
                reason: "literal run past end of block",
            });
        }
        if out.len() + literal_len > max_out {
            return Err(Lz4Error::OversizedBlock {
                position,
                declared: out.len() + literal_len,
            });
        }
        out.extend_from_slice(&input[ip..ip + literal_len]);
        ip += literal_len;

        // The final sequence of a block carries literals only.
        if ip == input.len() {
            break;
        }

        if ip + 2 > input.len() {
            return Err(Lz4Error::InvalidSequence {
                position,
                reason: "truncated match offset",
            });
        }
        let offset = u16::from_le_bytes([input[ip], input[ip + 1]]) as usize;
        ip += 2;
        if offset == 0 || offset > out.len() {
            return Err(Lz4Error::InvalidSequence {
                position,
                reason: "match offset out of bounds",
            });
        }

        let mut match_len = (token & 0x0F) as usize + 4;
        if token & 0x0F == 15 {
            match_len += read_lsic(input, &mut ip, position)?;
        }
        if out.len() + match_len > max_out {
            return Err(Lz4Error::OversizedBlock {
                position,
                declared: out.len() + match_len,
            });
        }

        // Byte-wise copy: matches may overlap their own output.
        let start = out.len() - offset;
        for i in 0..match_len {
            let b = out[start + i];
            out.push(b);
        }
    }
    Ok(())
}

fn read_lsic(input: &[u8], ip: &mut usize, position: u64) -> Result<usize, Lz4Error> {
    let mut extra = 0usize;
    loop {
        let &b = input.get(*ip).ok_or(Lz4Error::InvalidSequence {
            position,
            reason: "truncated length extension",
        })?;
        *ip += 1;
        extra += b as usize;
        if b != 255 {
            return Ok(extra);
        }
    }
}

/// Exact decompressed size of a frame.
///
/// Uses the header's content-size field when present; otherwise runs a
/// counting decode over the whole frame.
pub fn decoded_size<R: Read>(reader: R) -> Result<u64, Lz4Error> {
    let mut decoder = Lz4FrameDecoder::new(reader)?;
    if let Some(size) = decoder.info.content_size {
        return Ok(size);
    }
    while decoder.next_block()?.is_some() {}
    Ok(decoder.produced)
}
