//! Partition matcher.
//!
//! Resolves an archive member name to the `(partition_id, device_type)`
//! pair the transfer finalizer needs, using the device PIT when one is
//! available and a filename heuristic when it is not.

use tracing::debug;

use crate::pit::Pit;

/// Flash destination of one member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionTarget {
    pub partition_id: u32,
    pub device_type: u32,
}

/// Match `name` against the PIT. Rules are tried in order; the first hit
/// wins. `None` when the PIT knows nothing about this member.
pub fn match_pit(name: &str, pit: &Pit) -> Option<PartitionTarget> {
    let base = strip_suffixes(name);
    for entry in &pit.entries {
        let flash_base = strip_img_bin(&entry.flash_filename);
        let hit = name.eq_ignore_ascii_case(&entry.flash_filename)
            || base.eq_ignore_ascii_case(&flash_base)
            || base.eq_ignore_ascii_case(&entry.partition_name)
            || normalize(&base) == normalize(&entry.partition_name)
            || normalize(&base) == normalize(&flash_base);
        if hit {
            debug!(member = name, partition = %entry.partition_name, id = entry.partition_id, "matched PIT entry");
            return Some(PartitionTarget {
                partition_id: entry.partition_id,
                device_type: entry.device_type,
            });
        }
    }
    None
}

/// Fallback when no PIT is available at all: well-known partition ids
/// by filename.
pub fn match_heuristic(name: &str) -> PartitionTarget {
    let base = strip_suffixes(name).to_ascii_lowercase();
    let partition_id = if base.contains("sboot") || base.contains("bootloader") || base == "bl" {
        80
    } else if base.contains("recovery") {
        10
    } else if base.contains("boot") {
        3
    } else if base.contains("modem") || base.contains("radio") || base == "cp" {
        11
    } else {
        0
    };
    PartitionTarget {
        partition_id,
        device_type: 2,
    }
}

/// Resolve a member against an optional PIT.
pub fn resolve(name: &str, pit: Option<&Pit>) -> Option<PartitionTarget> {
    match pit {
        Some(p) => match_pit(name, p),
        None => Some(match_heuristic(name)),
    }
}

/// Strip compression and image suffixes until none remain:
/// `boot.img.lz4` -> `boot`.
fn strip_suffixes(name: &str) -> String {
    let mut base = name;
    loop {
        let lower = base.to_ascii_lowercase();
        let stripped = [".lz4", ".gz", ".img", ".bin"]
            .iter()
            .find(|s| lower.ends_with(*s))
            .map(|s| &base[..base.len() - s.len()]);
        match stripped {
            Some(rest) => base = rest,
            None => return base.to_string(),
        }
    }
}

fn strip_img_bin(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    for suffix in [".img", ".bin"] {
        if lower.ends_with(suffix) {
            return name[..name.len() - suffix.len()].to_string();
        }
    }
    name.to_string()
}

fn normalize(name: &str) -> String {
    name.to_ascii_lowercase().replace('-', "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pit::{Pit, PitEntry};

    fn pit_with(entries: &[(&str, &str, u32, u32)]) -> Pit {
        Pit {
            entries: entries
                .iter()
                .map(|&(name, flash, id, devtype)| PitEntry {
                    partition_name: name.to_string(),
                    flash_filename: flash.to_string(),
                    partition_id: id,
                    device_type: devtype,
                    ..Default::default()
                })
                .collect(),
        }
    }

    #[test]
    fn exact_flash_filename_wins() {
        let pit = pit_with(&[("BOOT", "boot.img", 3, 2)]);
        let t = match_pit("BOOT.IMG", &pit).unwrap();
        assert_eq!(t.partition_id, 3);
    }

    #[test]
    fn compressed_member_matches_through_base() {
        let pit = pit_with(&[
            ("BOOTLOADER", "sboot.bin", 80, 2),
            ("BOOT", "boot.img", 3, 2),
        ]);
        // base(boot.img.lz4) = boot, strip_img_bin(boot.img) = boot
        let t = match_pit("boot.img.lz4", &pit).unwrap();
        assert_eq!(t, PartitionTarget { partition_id: 3, device_type: 2 });

        let t = match_pit("sboot.bin.lz4", &pit).unwrap();
        assert_eq!(t.partition_id, 80);
    }

    #[test]
    fn partition_name_rule() {
        let pit = pit_with(&[("USERDATA", "super.img", 21, 2)]);
        assert_eq!(
            match_pit("userdata.img.lz4", &pit).unwrap().partition_id,
            21
        );
    }

    #[test]
    fn dash_underscore_normalization() {
        let pit = pit_with(&[("VBMETA_SYSTEM", "vbmeta_system.img", 28, 2)]);
        assert_eq!(
            match_pit("vbmeta-system.img", &pit).unwrap().partition_id,
            28
        );
    }

    #[test]
    fn unmatched_member_is_none() {
        let pit = pit_with(&[("BOOT", "boot.img", 3, 2)]);
        assert!(match_pit("oddball.img", &pit).is_none());
    }

    #[test]
    fn heuristic_table() {
        assert_eq!(match_heuristic("boot.img").partition_id, 3);
        assert_eq!(match_heuristic("recovery.img.lz4").partition_id, 10);
        assert_eq!(match_heuristic("sboot.bin").partition_id, 80);
        assert_eq!(match_heuristic("bl.bin").partition_id, 80);
        assert_eq!(match_heuristic("modem.bin").partition_id, 11);
        assert_eq!(match_heuristic("radio.img").partition_id, 11);
        assert_eq!(match_heuristic("cp.bin").partition_id, 11);
        assert_eq!(match_heuristic("cache.img").partition_id, 0);
        assert_eq!(match_heuristic("boot.img").device_type, 2);
    }

    #[test]
    fn suffix_stripping() {
        assert_eq!(strip_suffixes("boot.img.lz4"), "boot");
        assert_eq!(strip_suffixes("modem.bin.gz"), "modem");
        assert_eq!(strip_suffixes("system.img"), "system");
        assert_eq!(strip_suffixes("GALAXY.pit"), "GALAXY.pit");
    }
}
