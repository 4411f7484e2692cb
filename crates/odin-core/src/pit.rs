//! Partition Information Table codec.
//!
//! The PIT is the device's binary partition map: a 28-byte header
//! followed by fixed 132-byte entries. All integers are little-endian;
//! the three name fields are NUL-padded ASCII in 32-byte slots.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use thiserror::Error;

/// Header magic of every valid PIT.
pub const PIT_MAGIC: u32 = 0x1234_9876;
/// Header width in bytes.
pub const PIT_HEADER_SIZE: usize = 28;
/// Width of one entry in bytes.
pub const PIT_ENTRY_SIZE: usize = 132;

const NAME_FIELD: usize = 32;

#[derive(Error, Debug)]
pub enum PitError {
    #[error("Invalid magic: expected 0x{PIT_MAGIC:08X}, got 0x{actual:08X}")]
    BadMagic { actual: u32 },

    #[error("Truncated PIT: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Announced PIT size {announced} is outside the valid range")]
    SizeOutOfRange { announced: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One partition record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PitEntry {
    pub binary_type: u32,
    pub device_type: u32,
    pub partition_id: u32,
    pub partition_type: u32,
    pub filesystem: u32,
    pub start_block: u32,
    pub num_blocks: u32,
    pub file_offset: u32,
    pub file_size: u32,
    pub partition_name: String,
    pub flash_filename: String,
    pub fota_filename: String,
}

impl PitEntry {
    fn parse(data: &[u8]) -> Result<Self, PitError> {
        let mut cur = Cursor::new(data);
        Ok(Self {
            binary_type: cur.read_u32::<LittleEndian>()?,
            device_type: cur.read_u32::<LittleEndian>()?,
            partition_id: cur.read_u32::<LittleEndian>()?,
            partition_type: cur.read_u32::<LittleEndian>()?,
            filesystem: cur.read_u32::<LittleEndian>()?,
            start_block: cur.read_u32::<LittleEndian>()?,
            num_blocks: cur.read_u32::<LittleEndian>()?,
            file_offset: cur.read_u32::<LittleEndian>()?,
            file_size: cur.read_u32::<LittleEndian>()?,
            partition_name: read_name(&data[36..36 + NAME_FIELD]),
            flash_filename: read_name(&data[68..68 + NAME_FIELD]),
            fota_filename: read_name(&data[100..100 + NAME_FIELD]),
        })
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        out.write_u32::<LittleEndian>(self.binary_type).unwrap();
        out.write_u32::<LittleEndian>(self.device_type).unwrap();
        out.write_u32::<LittleEndian>(self.partition_id).unwrap();
        out.write_u32::<LittleEndian>(self.partition_type).unwrap();
        out.write_u32::<LittleEndian>(self.filesystem).unwrap();
        out.write_u32::<LittleEndian>(self.start_block).unwrap();
        out.write_u32::<LittleEndian>(self.num_blocks).unwrap();
        out.write_u32::<LittleEndian>(self.file_offset).unwrap();
        out.write_u32::<LittleEndian>(self.file_size).unwrap();
        write_name(out, &self.partition_name);
        write_name(out, &self.flash_filename);
        write_name(out, &self.fota_filename);
    }
}

/// Parsed partition table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pit {
    pub entries: Vec<PitEntry>,
}

impl Pit {
    /// Parse a PIT blob. Fails on bad magic, short input, or a count
    /// that the payload cannot satisfy.
    pub fn parse(data: &[u8]) -> Result<Self, PitError> {
        if data.len() < PIT_HEADER_SIZE {
            return Err(PitError::Truncated {
                expected: PIT_HEADER_SIZE,
                actual: data.len(),
            });
        }
        let mut cur = Cursor::new(data);
        let magic = cur.read_u32::<LittleEndian>()?;
        if magic != PIT_MAGIC {
            return Err(PitError::BadMagic { actual: magic });
        }
        let count = cur.read_u32::<LittleEndian>()? as usize;

        let expected = PIT_HEADER_SIZE + count * PIT_ENTRY_SIZE;
        if data.len() < expected {
            return Err(PitError::Truncated {
                expected,
                actual: data.len(),
            });
        }

        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let start = PIT_HEADER_SIZE + i * PIT_ENTRY_SIZE;
            entries.push(PitEntry::parse(&data[start..start + PIT_ENTRY_SIZE])?);
        }
        Ok(Self { entries })
    }

    /// Serialize back to the binary format. `parse(serialize(p)) == p`.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PIT_HEADER_SIZE + self.entries.len() * PIT_ENTRY_SIZE);
        out.write_u32::<LittleEndian>(PIT_MAGIC).unwrap();
        out.write_u32::<LittleEndian>(self.entries.len() as u32)
            .unwrap();
        // Remainder of the 28-byte header is reserved.
        out.resize(PIT_HEADER_SIZE, 0);
        for entry in &self.entries {
            entry.serialize(&mut out);
        }
        out
    }

    /// Find an entry by its partition name (case-insensitive).
    pub fn find_by_name(&self, name: &str) -> Option<&PitEntry> {
        self.entries
            .iter()
            .find(|e| e.partition_name.eq_ignore_ascii_case(name))
    }
}

fn read_name(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    field[..end].iter().map(|&b| b as char).collect()
}

fn write_name(out: &mut Vec<u8>, name: &str) {
    let mut field = [0u8; NAME_FIELD];
    // Truncate to 31 bytes so the field always carries a terminator.
    for (slot, ch) in field[..NAME_FIELD - 1].iter_mut().zip(name.bytes()) {
        *slot = ch;
    }
    out.extend_from_slice(&field);
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_entry(name: &str, flash: &str, id: u32, device_type: u32) -> PitEntry {
        PitEntry {
            binary_type: 0,
            device_type,
            partition_id: id,
            partition_type: 2,
            filesystem: 0,
            start_block: 1024,
            num_blocks: 2048,
            file_offset: 0,
            file_size: 0,
            partition_name: name.to_string(),
            flash_filename: flash.to_string(),
            fota_filename: String::new(),
        }
    }

    #[test]
    fn parse_two_entries_roundtrip() {
        let pit = Pit {
            entries: vec![
                sample_entry("BOOTLOADER", "sboot.bin", 80, 2),
                sample_entry("BOOT", "boot.img", 3, 2),
            ],
        };
        let bytes = pit.serialize();
        assert_eq!(bytes.len(), PIT_HEADER_SIZE + 2 * PIT_ENTRY_SIZE);

        let parsed = Pit::parse(&bytes).unwrap();
        assert_eq!(parsed.entries.len(), 2);
        assert_eq!(parsed.entries[0].partition_name, "BOOTLOADER");
        assert_eq!(parsed.entries[1].flash_filename, "boot.img");
        assert_eq!(parsed, pit);
        assert_eq!(parsed.serialize(), bytes);
    }

    #[test]
    fn bad_magic_rejected() {
        let mut bytes = Pit::default().serialize();
        bytes[0] = 0x77;
        assert!(matches!(
            Pit::parse(&bytes),
            Err(PitError::BadMagic { .. })
        ));
    }

    #[test]
    fn truncated_input_rejected() {
        let pit = Pit {
            entries: vec![sample_entry("EFS", "efs.img", 20, 2)],
        };
        let bytes = pit.serialize();
        assert!(matches!(
            Pit::parse(&bytes[..bytes.len() - 1]),
            Err(PitError::Truncated { .. })
        ));
        assert!(matches!(
            Pit::parse(&bytes[..10]),
            Err(PitError::Truncated { .. })
        ));
    }

    #[test]
    fn names_truncate_to_31_bytes() {
        let long = "X".repeat(60);
        let pit = Pit {
            entries: vec![sample_entry(&long, "f", 1, 2)],
        };
        let parsed = Pit::parse(&pit.serialize()).unwrap();
        assert_eq!(parsed.entries[0].partition_name.len(), 31);
    }

    #[test]
    fn find_by_name_ignores_case() {
        let pit = Pit {
            entries: vec![sample_entry("BOOT", "boot.img", 3, 2)],
        };
        assert!(pit.find_by_name("boot").is_some());
        assert!(pit.find_by_name("cache").is_none());
    }

    prop_compose! {
        fn arb_name()(s in "[A-Z0-9_]{0,31}") -> String { s }
    }

    prop_compose! {
        fn arb_entry()(
            fields in proptest::array::uniform9(any::<u32>()),
            partition_name in arb_name(),
            flash_filename in arb_name(),
            fota_filename in arb_name(),
        ) -> PitEntry {
            PitEntry {
                binary_type: fields[0],
                device_type: fields[1],
                partition_id: fields[2],
                partition_type: fields[3],
                filesystem: fields[4],
                start_block: fields[5],
                num_blocks: fields[6],
                file_offset: fields[7],
                file_size: fields[8],
                partition_name,
                flash_filename,
                fota_filename,
            }
        }
    }

    proptest! {
        #[test]
        fn roundtrip_any_wellformed_pit(entries in proptest::collection::vec(arb_entry(), 0..24)) {
            let pit = Pit { entries };
            let parsed = Pit::parse(&pit.serialize()).unwrap();
            prop_assert_eq!(parsed, pit);
        }
    }
}
