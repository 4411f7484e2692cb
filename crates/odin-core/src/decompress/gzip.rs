//! Streaming GZIP decoding via flate2.
//!
//! Same pull-stream shape as the LZ4 decoder so the transfer pipeline
//! can drain either without caring which.

use flate2::read::GzDecoder;
use std::io::{Read, Seek, SeekFrom};

use super::DecompressError;
use crate::protocol::constants::FILE_BLOCK_SIZE;

/// Pull-stream of decompressed blocks over one GZIP member.
pub struct GzipStream<R: Read> {
    inner: GzDecoder<R>,
    buf: Vec<u8>,
    filled: usize,
    produced: u64,
}

impl<R: Read> GzipStream<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: GzDecoder::new(reader),
            buf: vec![0u8; FILE_BLOCK_SIZE],
            filled: 0,
            produced: 0,
        }
    }

    pub fn produced(&self) -> u64 {
        self.produced
    }

    /// Inflate the next block of up to `FILE_BLOCK_SIZE` bytes.
    /// `None` at end of stream.
    pub fn next_block(&mut self) -> Result<Option<&[u8]>, DecompressError> {
        self.filled = 0;
        while self.filled < self.buf.len() {
            let n = self
                .inner
                .read(&mut self.buf[self.filled..])
                .map_err(|e| DecompressError::Gzip {
                    position: self.produced,
                    source: e,
                })?;
            if n == 0 {
                break;
            }
            self.filled += n;
        }
        if self.filled == 0 {
            return Ok(None);
        }
        self.produced += self.filled as u64;
        Ok(Some(&self.buf[..self.filled]))
    }
}

/// Decompressed size from the RFC 1952 ISIZE trailer (last 4 bytes,
/// little-endian). Exact for payloads below 4 GiB, which firmware
/// members compressed with gzip are in practice.
pub fn isize_hint<R: Read + Seek>(reader: &mut R) -> std::io::Result<u64> {
    reader.seek(SeekFrom::End(-4))?;
    let mut trailer = [0u8; 4];
    reader.read_exact(&mut trailer)?;
    Ok(u64::from(u32::from_le_bytes(trailer)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::{Cursor, Write};

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn streams_in_block_sized_pieces() {
        let payload = vec![0x5Au8; FILE_BLOCK_SIZE + 1000];
        let compressed = gzip(&payload);

        let mut dec = GzipStream::new(compressed.as_slice());
        let first = dec.next_block().unwrap().unwrap();
        assert_eq!(first.len(), FILE_BLOCK_SIZE);
        let second = dec.next_block().unwrap().unwrap().to_vec();
        assert_eq!(second.len(), 1000);
        assert!(dec.next_block().unwrap().is_none());
        assert_eq!(dec.produced(), payload.len() as u64);
    }

    #[test]
    fn isize_trailer_is_exact() {
        let payload = vec![1u8; 12345];
        let compressed = gzip(&payload);
        let mut cur = Cursor::new(compressed);
        assert_eq!(isize_hint(&mut cur).unwrap(), 12345);
    }

    #[test]
    fn corrupt_stream_errors() {
        let mut compressed = gzip(b"hello world");
        let mid = compressed.len() / 2;
        compressed[mid] ^= 0xFF;
        let mut dec = GzipStream::new(compressed.as_slice());
        let mut result = Ok(());
        loop {
            match dec.next_block() {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        assert!(result.is_err());
    }
}
