//! Firmware distribution model.
//!
//! `Firmware::load` walks the outer TAR (descending into nested
//! archives), classifies every member, pulls out the embedded PIT and
//! the outer digest, and leaves bodies on disk: a `Member` only records
//! where its bytes live.

use md5::{Digest, Md5};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use tracing::{debug, warn};

use super::tar::{self, ArchiveError};
use crate::protocol::constants::{FILE_BLOCK_SIZE, PIT_SIZE_LIMIT};

/// Random-access byte source a firmware distribution is read from.
pub trait Source: Read + Seek + Send {}
impl<T: Read + Seek + Send> Source for T {}

/// Nested archives inside nested archives exist (outer `.zip`-less
/// bundles wrapping `AP_*.tar.md5` files); anything deeper does not.
const MAX_NESTING: u32 = 2;

/// Per-member compression, derived from the file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Lz4,
    Gzip,
}

impl Compression {
    pub fn from_name(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".lz4") {
            Compression::Lz4
        } else if lower.ends_with(".gz") {
            Compression::Gzip
        } else {
            Compression::None
        }
    }
}

/// One flashable archive member. Owns no bytes; `offset`/`size` locate
/// the stored body inside the enclosing source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub name: String,
    pub size: u64,
    pub offset: u64,
    pub compression: Compression,
    pub nested: bool,
}

/// A loaded firmware distribution.
pub struct Firmware {
    pub members: Vec<Member>,
    /// Outer digest from the `<hex>  <name>` tail, lowercase.
    pub md5: Option<String>,
    /// Raw PIT carried as a `*.pit` member, if any.
    pub embedded_pit: Option<Vec<u8>>,
    source: Box<dyn Source>,
    tar_region_len: u64,
}

impl Firmware {
    pub fn open(path: &Path) -> Result<Self, ArchiveError> {
        Self::load(Box::new(File::open(path)?))
    }

    pub fn load(mut source: Box<dyn Source>) -> Result<Self, ArchiveError> {
        let file_len = source.seek(SeekFrom::End(0))?;
        let (md5, tar_region_len) = match tar::md5_tail(&mut source, file_len)? {
            Some((digest, region)) => (Some(digest), region),
            None => (None, file_len),
        };

        let mut members = Vec::new();
        let mut embedded_pit = None;
        collect(
            &mut *source,
            0,
            tar_region_len,
            0,
            &mut members,
            &mut embedded_pit,
        )?;

        Ok(Self {
            members,
            md5,
            embedded_pit,
            source,
            tar_region_len,
        })
    }

    /// Reader over one member's stored bytes.
    pub fn reader(&mut self, member: &Member) -> SectionReader<'_> {
        SectionReader::new(&mut *self.source, member.offset, member.size)
    }

    /// Check the outer digest against the TAR region.
    ///
    /// `None` when the distribution carries no digest. Verification is
    /// advisory; it never gates flashing.
    pub fn verify_md5(&mut self) -> Result<Option<bool>, ArchiveError> {
        let Some(expected) = self.md5.clone() else {
            return Ok(None);
        };
        self.source.seek(SeekFrom::Start(0))?;
        let mut hasher = Md5::new();
        let mut remaining = self.tar_region_len;
        let mut buf = vec![0u8; FILE_BLOCK_SIZE];
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            self.source.read_exact(&mut buf[..want])?;
            hasher.update(&buf[..want]);
            remaining -= want as u64;
        }
        let actual = format!("{:x}", hasher.finalize());
        Ok(Some(actual == expected))
    }

    /// Sum of stored member sizes.
    pub fn stored_bytes(&self) -> u64 {
        self.members.iter().map(|m| m.size).sum()
    }
}

impl std::fmt::Debug for Firmware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Firmware")
            .field("members", &self.members)
            .field("md5", &self.md5)
            .field("embedded_pit", &self.embedded_pit.as_ref().map(Vec::len))
            .finish()
    }
}

fn collect(
    source: &mut dyn Source,
    start: u64,
    len: u64,
    depth: u32,
    members: &mut Vec<Member>,
    embedded_pit: &mut Option<Vec<u8>>,
) -> Result<(), ArchiveError> {
    // A nested region may itself end in a digest tail.
    let region_len = if depth == 0 {
        len
    } else {
        let mut section = SectionReader::new(source, start, len);
        match tar::md5_tail(&mut section, len)? {
            Some((_, region)) => region,
            None => len,
        }
    };

    for raw in tar::scan(source, start, region_len)? {
        let name = raw.name.clone();
        let lower = name.to_ascii_lowercase();

        if tar::is_nested_archive(&name) && depth < MAX_NESTING {
            match collect(source, raw.offset, raw.size, depth + 1, members, embedded_pit) {
                Ok(()) => continue,
                Err(e) => {
                    // Named like an archive but not one; flash it as-is.
                    warn!(member = %name, error = %e, "nested member did not parse, keeping as plain member");
                }
            }
        }

        if lower.ends_with(".pit") {
            if raw.size > u64::from(PIT_SIZE_LIMIT) {
                return Err(ArchiveError::BadHeader {
                    offset: raw.offset,
                    reason: format!("embedded PIT of {} bytes exceeds the limit", raw.size),
                });
            }
            let mut buf = vec![0u8; raw.size as usize];
            source.seek(SeekFrom::Start(raw.offset))?;
            source.read_exact(&mut buf)?;
            debug!(member = %name, bytes = buf.len(), "embedded PIT");
            *embedded_pit = Some(buf);
            continue;
        }

        if lower.contains("meta-data/") || lower.ends_with(".zip") || raw.size == 0 {
            debug!(member = %name, size = raw.size, "skipping non-flashable member");
            continue;
        }

        members.push(Member {
            compression: Compression::from_name(&name),
            nested: tar::is_nested_archive(&name),
            name,
            size: raw.size,
            offset: raw.offset,
        });
    }
    Ok(())
}

/// `Read + Seek` over a byte range of a larger source.
pub struct SectionReader<'a> {
    src: &'a mut dyn Source,
    start: u64,
    len: u64,
    pos: u64,
}

impl<'a> SectionReader<'a> {
    pub fn new(src: &'a mut dyn Source, start: u64, len: u64) -> Self {
        Self {
            src,
            start,
            len,
            pos: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Read for SectionReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let remaining = self.len - self.pos.min(self.len);
        if remaining == 0 {
            return Ok(0);
        }
        let want = buf.len().min(remaining as usize);
        self.src.seek(SeekFrom::Start(self.start + self.pos))?;
        let n = self.src.read(&mut buf[..want])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for SectionReader<'_> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(o) => o as i64,
            SeekFrom::End(o) => self.len as i64 + o,
            SeekFrom::Current(o) => self.pos as i64 + o,
        };
        if target < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start of section",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::tar::tests::make_archive;
    use std::io::Cursor;

    #[test]
    fn compression_from_extension() {
        assert_eq!(Compression::from_name("boot.img.lz4"), Compression::Lz4);
        assert_eq!(Compression::from_name("modem.bin.GZ"), Compression::Gzip);
        assert_eq!(Compression::from_name("cache.img"), Compression::None);
    }

    #[test]
    fn load_flat_archive() {
        let archive = make_archive(&[
            ("boot.img.lz4", &[1u8; 1000]),
            ("modem.bin", &[2u8; 4000]),
        ]);
        let fw = Firmware::load(Box::new(Cursor::new(archive))).unwrap();
        assert_eq!(fw.members.len(), 2);
        assert_eq!(fw.members[0].compression, Compression::Lz4);
        assert_eq!(fw.members[1].offset, 2048);
        assert!(fw.md5.is_none());
        assert!(fw.embedded_pit.is_none());
    }

    #[test]
    fn skip_policy() {
        let archive = make_archive(&[
            ("meta-data/fota.zip", &[1u8; 64]),
            ("extras.zip", &[2u8; 64]),
            ("empty.img", &[]),
            ("boot.img", &[3u8; 64]),
        ]);
        let fw = Firmware::load(Box::new(Cursor::new(archive))).unwrap();
        assert_eq!(fw.members.len(), 1);
        assert_eq!(fw.members[0].name, "boot.img");
    }

    #[test]
    fn pit_member_becomes_embedded_pit() {
        let pit_bytes = crate::pit::Pit::default().serialize();
        let archive = make_archive(&[
            ("GALAXY.pit", &pit_bytes),
            ("boot.img", &[3u8; 64]),
        ]);
        let fw = Firmware::load(Box::new(Cursor::new(archive))).unwrap();
        assert_eq!(fw.members.len(), 1);
        assert_eq!(fw.embedded_pit.as_deref(), Some(pit_bytes.as_slice()));
    }

    #[test]
    fn nested_archive_is_descended() {
        let inner = make_archive(&[("boot.img", &[7u8; 700]), ("recovery.img", &[8u8; 300])]);
        let archive = make_archive(&[("AP_PHONE.tar", &inner), ("modem.bin", &[9u8; 100])]);
        let mut fw = Firmware::load(Box::new(Cursor::new(archive))).unwrap();

        let names: Vec<_> = fw.members.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["boot.img", "recovery.img", "modem.bin"]);

        // offsets are absolute: reading a nested member yields its bytes
        let member = fw.members[0].clone();
        let mut body = Vec::new();
        fw.reader(&member).read_to_end(&mut body).unwrap();
        assert_eq!(body, vec![7u8; 700]);
    }

    #[test]
    fn nested_archive_with_digest_tail() {
        let mut inner = make_archive(&[("sboot.bin", &[5u8; 128])]);
        inner.extend_from_slice(b"00112233445566778899aabbccddeeff  BL_PHONE.tar\n");
        let archive = make_archive(&[("BL_PHONE.tar.md5", &inner)]);
        let fw = Firmware::load(Box::new(Cursor::new(archive))).unwrap();
        assert_eq!(fw.members.len(), 1);
        assert_eq!(fw.members[0].name, "sboot.bin");
    }

    #[test]
    fn misnamed_nested_member_is_kept_plain() {
        // ends in .cp but is not a TAR
        let archive = make_archive(&[("modem.cp", &[0xFFu8; 600])]);
        let fw = Firmware::load(Box::new(Cursor::new(archive))).unwrap();
        assert_eq!(fw.members.len(), 1);
        assert!(fw.members[0].nested);
    }

    #[test]
    fn verify_md5_matches() {
        let archive = make_archive(&[("boot.img", &[1u8; 100])]);
        let digest = format!("{:x}", Md5::digest(&archive));
        let mut tailed = archive.clone();
        tailed.extend_from_slice(format!("{digest}  firmware.tar\n").as_bytes());

        let mut fw = Firmware::load(Box::new(Cursor::new(tailed))).unwrap();
        assert_eq!(fw.verify_md5().unwrap(), Some(true));

        let mut plain = Firmware::load(Box::new(Cursor::new(archive))).unwrap();
        assert_eq!(plain.verify_md5().unwrap(), None);
    }

    #[test]
    fn section_reader_bounds() {
        let data: Vec<u8> = (0u8..100).collect();
        let mut src: Box<dyn Source> = Box::new(Cursor::new(data));
        let mut section = SectionReader::new(&mut *src, 10, 20);
        let mut out = Vec::new();
        section.read_to_end(&mut out).unwrap();
        assert_eq!(out, (10u8..30).collect::<Vec<_>>());

        section.seek(SeekFrom::Start(5)).unwrap();
        let mut b = [0u8; 4];
        section.read_exact(&mut b).unwrap();
        assert_eq!(b, [15, 16, 17, 18]);
    }
}
