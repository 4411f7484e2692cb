//! Streaming USTAR scanner.
//!
//! Walks the 512-byte header/data discipline of a firmware distribution
//! and yields member descriptors without ever materializing member
//! bodies. Bodies are drawn later through a random-access reader over
//! the recorded `(offset, size)` range.

use std::io::{Read, Seek, SeekFrom};
use thiserror::Error;

/// TAR block granularity.
pub const BLOCK_SIZE: u64 = 512;

const NAME_FIELD: usize = 100;
const SIZE_FIELD: std::ops::Range<usize> = 124..136;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Bad archive header at offset {offset}: {reason}")]
    BadHeader { offset: u64, reason: String },

    #[error("Premature end of archive at offset {offset}")]
    PrematureEnd { offset: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One member descriptor: where its body lives, not the body itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarMember {
    pub name: String,
    pub size: u64,
    /// Absolute offset of the data region within the scanned source.
    pub offset: u64,
}

/// Scan the TAR region `[start, start + len)` of `src`.
///
/// Stops at the first fully-zero header block. Running off the region
/// without seeing one is a format error.
pub fn scan<R: Read + Seek + ?Sized>(
    src: &mut R,
    start: u64,
    len: u64,
) -> Result<Vec<TarMember>, ArchiveError> {
    let end = start + len;
    let mut pos = start;
    let mut members = Vec::new();
    let mut header = [0u8; BLOCK_SIZE as usize];

    loop {
        if pos + BLOCK_SIZE > end {
            return Err(ArchiveError::PrematureEnd { offset: pos });
        }
        src.seek(SeekFrom::Start(pos))?;
        src.read_exact(&mut header)?;

        if header.iter().all(|&b| b == 0) {
            break;
        }

        let name = parse_name(&header).ok_or_else(|| ArchiveError::BadHeader {
            offset: pos,
            reason: "member name is not NUL-terminated ASCII".into(),
        })?;
        if name.is_empty() {
            return Err(ArchiveError::BadHeader {
                offset: pos,
                reason: "empty member name".into(),
            });
        }
        let size = parse_octal(&header[SIZE_FIELD]).ok_or_else(|| ArchiveError::BadHeader {
            offset: pos,
            reason: "size field is not octal ASCII".into(),
        })?;

        let data_offset = pos + BLOCK_SIZE;
        let padded = size.div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
        if data_offset + padded > end {
            return Err(ArchiveError::PrematureEnd { offset: data_offset });
        }

        members.push(TarMember {
            name,
            size,
            offset: data_offset,
        });
        pos = data_offset + padded;
    }

    Ok(members)
}

/// Detect the Samsung digest tail: a final line `<32-hex>  <filename>\n`
/// appended after the TAR proper.
///
/// Returns the lowercase digest and the length of the TAR region that
/// precedes the tail. `None` when no such line is present.
pub fn md5_tail<R: Read + Seek>(
    src: &mut R,
    file_len: u64,
) -> Result<Option<(String, u64)>, ArchiveError> {
    let probe = file_len.min(BLOCK_SIZE);
    if probe < 35 {
        return Ok(None);
    }
    src.seek(SeekFrom::Start(file_len - probe))?;
    let mut tail = vec![0u8; probe as usize];
    src.read_exact(&mut tail)?;

    if tail.last() != Some(&b'\n') {
        return Ok(None);
    }
    let line_start = tail[..tail.len() - 1]
        .iter()
        .rposition(|&b| b == b'\n')
        .map(|i| i + 1)
        .unwrap_or(0);
    let line = &tail[line_start..tail.len() - 1];

    // <32 hex>  <filename>
    if line.len() < 35 || !line[..32].iter().all(u8::is_ascii_hexdigit) {
        return Ok(None);
    }
    if &line[32..34] != b"  " || line[34..].is_empty() {
        return Ok(None);
    }

    let digest: String = line[..32]
        .iter()
        .map(|&b| (b as char).to_ascii_lowercase())
        .collect();
    let tail_len = (tail.len() - line_start) as u64;
    Ok(Some((digest, file_len - tail_len)))
}

/// Members that are themselves TAR archives, recognized by name.
pub fn is_nested_archive(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".tar")
        || lower.contains(".tar.")
        || [".ap", ".bl", ".cp", ".csc"]
            .iter()
            .any(|suffix| lower.ends_with(suffix))
}

fn parse_name(header: &[u8]) -> Option<String> {
    let field = &header[..NAME_FIELD];
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    let raw = &field[..end];
    if raw.iter().any(|&b| !b.is_ascii() || b == b'\n') {
        return None;
    }
    Some(String::from_utf8_lossy(raw).trim().to_string())
}

fn parse_octal(field: &[u8]) -> Option<u64> {
    let text: &[u8] = {
        let start = field.iter().position(|&b| b != b' ')?;
        let end = field[start..]
            .iter()
            .position(|&b| b == 0 || b == b' ')
            .map(|i| start + i)
            .unwrap_or(field.len());
        &field[start..end]
    };
    if text.is_empty() {
        return None;
    }
    let mut value: u64 = 0;
    for &b in text {
        if !(b'0'..=b'7').contains(&b) {
            return None;
        }
        value = value.checked_mul(8)?.checked_add(u64::from(b - b'0'))?;
    }
    Some(value)
}
