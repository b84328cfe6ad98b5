//! MBR partition lookup.
//!
//! Resolves a partition number to the byte window it occupies. Primary
//! partitions are numbered 1-4 by table slot. Logical partitions continue
//! from 5: every extended-partition link contributes four numbers, whether
//! or not its slots are populated, so the second slot of the second link is
//! always partition 10.

use std::collections::HashSet;

use tracing::debug;

use crate::error::PartitionError;
use crate::types::{ExportWindow, SECTOR_SIZE};
use crate::volume::Volume;

const TABLE_OFFSET: usize = 446;
const ENTRY_SIZE: usize = 16;
const SIGNATURE: [u8; 2] = [0x55, 0xAA];

/// System types marking an extended partition (CHS and LBA flavors).
const EXTENDED_CHS: u8 = 0x05;
const EXTENDED_LBA: u8 = 0x0F;

/// One 16-byte partition record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionEntry {
    pub bootable: u8,
    pub start_head: u8,
    pub start_cylinder: u16,
    pub start_sector: u8,
    pub system_type: u8,
    pub end_head: u8,
    pub end_cylinder: u16,
    pub end_sector: u8,
    pub start_sector_abs: u32,
    pub sector_count: u32,
}

impl PartitionEntry {
    pub fn decode(p: &[u8; ENTRY_SIZE]) -> Self {
        Self {
            bootable: p[0],
            start_head: p[1],
            start_cylinder: p[3] as u16 | ((p[2] as u16) << 2 & 0x300),
            start_sector: p[2] & 0x3f,
            system_type: p[4],
            end_head: p[5],
            end_cylinder: p[7] as u16 | ((p[6] as u16) << 2 & 0x300),
            end_sector: p[6] & 0x3f,
            start_sector_abs: u32::from_le_bytes([p[8], p[9], p[10], p[11]]),
            sector_count: u32::from_le_bytes([p[12], p[13], p[14], p[15]]),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sector_count == 0
    }

    pub fn is_extended(&self) -> bool {
        matches!(self.system_type, EXTENDED_CHS | EXTENDED_LBA)
    }

    pub fn window(&self) -> ExportWindow {
        ExportWindow {
            offset: self.start_sector_abs as u64 * SECTOR_SIZE as u64,
            length: self.sector_count as u64 * SECTOR_SIZE as u64,
        }
    }
}

/// The four partition records of a boot sector (MBR or EBR).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionTable {
    pub entries: [PartitionEntry; 4],
}

impl PartitionTable {
    /// Decode a sector, failing if it carries no boot signature.
    pub fn decode(sector: &[u8; SECTOR_SIZE]) -> Result<Self, PartitionError> {
        if sector[510..512] != SIGNATURE {
            return Err(PartitionError::NoPartitionTable);
        }
        Ok(Self::decode_link(sector))
    }

    /// Decode the records of an extended-partition link. Links are trusted
    /// on the strength of the MBR that points at them, so the signature is
    /// not consulted.
    pub fn decode_link(sector: &[u8; SECTOR_SIZE]) -> Self {
        let mut entries = [PartitionEntry::default(); 4];
        for (i, entry) in entries.iter_mut().enumerate() {
            let start = TABLE_OFFSET + i * ENTRY_SIZE;
            let mut raw = [0u8; ENTRY_SIZE];
            raw.copy_from_slice(&sector[start..start + ENTRY_SIZE]);
            *entry = PartitionEntry::decode(&raw);
        }
        Self { entries }
    }
}

fn read_sector(volume: &dyn Volume, sector: u64) -> Result<[u8; SECTOR_SIZE], PartitionError> {
    volume
        .read_sector(sector)
        .map_err(|source| PartitionError::Read { sector, source })
}

/// Resolve partition `index` of the volume's MBR to its byte window.
pub fn resolve(volume: &dyn Volume, index: u32) -> Result<ExportWindow, PartitionError> {
    let mbr = PartitionTable::decode(&read_sector(volume, 0)?)?;
    let mut logical_base = 4u32;

    for (slot, entry) in mbr.entries.iter().enumerate() {
        if entry.is_empty() {
            continue;
        }
        if entry.is_extended() {
            if let Some(window) = walk_chain(volume, entry, index, &mut logical_base)? {
                return Ok(window);
            }
        } else if slot as u32 + 1 == index {
            return Ok(entry.window());
        }
    }

    Err(PartitionError::NotFound { index })
}

/// Follow an extended-partition chain looking for logical partition `index`.
///
/// `logical_base` is shared across chains and grows by 4 per link visited.
fn walk_chain(
    volume: &dyn Volume,
    extended: &PartitionEntry,
    index: u32,
    logical_base: &mut u32,
) -> Result<Option<ExportWindow>, PartitionError> {
    let mut visited = HashSet::new();
    let mut next = Some(extended.start_sector_abs as u64);

    while let Some(sector) = next.take() {
        if !visited.insert(sector) {
            debug!(sector, "extended partition chain loops back, stopping");
            break;
        }

        let link = PartitionTable::decode_link(&read_sector(volume, sector)?);

        for (slot, entry) in link.entries.iter().enumerate() {
            if entry.is_empty() {
                continue;
            }
            // Inside a link the pointer to the next link owns a number too.
            if *logical_base + slot as u32 + 1 == index {
                return Ok(Some(entry.window()));
            }
            if entry.is_extended() {
                next.get_or_insert(entry.start_sector_abs as u64);
            }
        }
        *logical_base += 4;
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::MemVolume;

    const DISK_SECTORS: usize = 256;

    fn write_entry(sector: &mut [u8], slot: usize, system: u8, start: u32, count: u32) {
        let p = &mut sector[TABLE_OFFSET + slot * ENTRY_SIZE..][..ENTRY_SIZE];
        p[4] = system;
        p[8..12].copy_from_slice(&start.to_le_bytes());
        p[12..16].copy_from_slice(&count.to_le_bytes());
    }

    fn sign(sector: &mut [u8]) {
        sector[510] = 0x55;
        sector[511] = 0xAA;
    }

    struct Disk(Vec<u8>);

    impl Disk {
        fn new() -> Self {
            Self(vec![0u8; DISK_SECTORS * SECTOR_SIZE])
        }

        fn sector(&mut self, n: usize) -> &mut [u8] {
            &mut self.0[n * SECTOR_SIZE..(n + 1) * SECTOR_SIZE]
        }

        fn volume(self) -> MemVolume {
            MemVolume::from_bytes(self.0)
        }
    }

    /// Primary 1 is extended at sector 100. Link 1 (sector 100) fills slots
    /// 0-1 and chains to link 2 (sector 150) through slot 3. Link 2 fills
    /// slots 0-1.
    fn two_link_disk() -> Disk {
        let mut disk = Disk::new();
        let mbr = disk.sector(0);
        write_entry(mbr, 0, EXTENDED_LBA, 100, 150);
        write_entry(mbr, 1, 0x83, 10, 20);
        sign(mbr);

        let link1 = disk.sector(100);
        write_entry(link1, 0, 0x83, 101, 10);
        write_entry(link1, 1, 0x83, 120, 5);
        write_entry(link1, 3, EXTENDED_CHS, 150, 100);
        sign(link1);

        let link2 = disk.sector(150);
        write_entry(link2, 0, 0x83, 151, 8);
        write_entry(link2, 1, 0x0c, 170, 30);
        sign(link2);
        disk
    }

    #[test]
    fn decodes_chs_fields() {
        let mut raw = [0u8; ENTRY_SIZE];
        raw[0] = 0x80;
        raw[1] = 0x01;
        raw[2] = 0xC1; // sector 1, cylinder high bits 0b11
        raw[3] = 0x05;
        raw[4] = 0x83;
        let entry = PartitionEntry::decode(&raw);
        assert_eq!(entry.bootable, 0x80);
        assert_eq!(entry.start_head, 1);
        assert_eq!(entry.start_sector, 1);
        assert_eq!(entry.start_cylinder, 0x305);
        assert_eq!(entry.system_type, 0x83);
    }

    #[test]
    fn resolves_primary_partition() {
        let mut disk = Disk::new();
        let mbr = disk.sector(0);
        write_entry(mbr, 0, 0x83, 2048, 4096);
        write_entry(mbr, 2, 0x07, 8192, 16);
        sign(mbr);
        let volume = disk.volume();

        assert_eq!(
            resolve(&volume, 1).unwrap(),
            ExportWindow {
                offset: 2048 * 512,
                length: 4096 * 512,
            }
        );
        assert_eq!(resolve(&volume, 3).unwrap().offset, 8192 * 512);
        assert!(matches!(
            resolve(&volume, 2),
            Err(PartitionError::NotFound { index: 2 })
        ));
    }

    #[test]
    fn missing_signature_means_no_table() {
        let mut disk = Disk::new();
        write_entry(disk.sector(0), 0, 0x83, 1, 1);
        let volume = disk.volume();

        for index in [1, 2, 5, 10] {
            assert!(matches!(
                resolve(&volume, index),
                Err(PartitionError::NoPartitionTable)
            ));
        }
    }

    #[test]
    fn extended_entry_is_not_a_direct_match() {
        let volume = two_link_disk().volume();
        // Slot 1 is extended; slot 2 is a regular partition.
        assert!(matches!(
            resolve(&volume, 1),
            Err(PartitionError::NotFound { index: 1 })
        ));
        assert_eq!(resolve(&volume, 2).unwrap().offset, 10 * 512);
    }

    #[test]
    fn logical_numbering_spans_links() {
        let volume = two_link_disk().volume();

        assert_eq!(resolve(&volume, 5).unwrap().offset, 101 * 512);
        assert_eq!(resolve(&volume, 6).unwrap().offset, 120 * 512);
        assert_eq!(resolve(&volume, 8).unwrap().offset, 150 * 512);
        assert_eq!(
            resolve(&volume, 10).unwrap(),
            ExportWindow {
                offset: 170 * 512,
                length: 30 * 512,
            }
        );
    }

    #[test]
    fn empty_slots_still_consume_numbers() {
        let volume = two_link_disk().volume();
        // Link 1 slot 2 is empty; 7 must not slide onto link 2.
        assert!(matches!(
            resolve(&volume, 7),
            Err(PartitionError::NotFound { index: 7 })
        ));
        assert_eq!(resolve(&volume, 9).unwrap().offset, 151 * 512);
    }

    #[test]
    fn index_past_last_link_not_found() {
        let volume = two_link_disk().volume();
        for index in [11, 12, 13, 40] {
            assert!(matches!(
                resolve(&volume, index),
                Err(PartitionError::NotFound { .. })
            ));
        }
    }

    #[test]
    fn each_extended_primary_starts_a_chain() {
        let mut disk = Disk::new();
        let mbr = disk.sector(0);
        write_entry(mbr, 0, EXTENDED_CHS, 40, 10);
        write_entry(mbr, 1, EXTENDED_LBA, 60, 10);
        sign(mbr);

        let first = disk.sector(40);
        write_entry(first, 0, 0x83, 41, 2);
        sign(first);
        let second = disk.sector(60);
        write_entry(second, 1, 0x83, 62, 3);
        sign(second);
        let volume = disk.volume();

        assert_eq!(resolve(&volume, 5).unwrap().offset, 41 * 512);
        assert_eq!(resolve(&volume, 10).unwrap().offset, 62 * 512);
    }

    #[test]
    fn self_referencing_link_terminates() {
        let mut disk = Disk::new();
        let mbr = disk.sector(0);
        write_entry(mbr, 0, EXTENDED_LBA, 30, 10);
        sign(mbr);
        let link = disk.sector(30);
        write_entry(link, 0, 0x83, 31, 1);
        write_entry(link, 1, EXTENDED_LBA, 30, 10);
        sign(link);
        let volume = disk.volume();

        assert_eq!(resolve(&volume, 5).unwrap().offset, 31 * 512);
        assert!(matches!(
            resolve(&volume, 9),
            Err(PartitionError::NotFound { index: 9 })
        ));
    }

    #[test]
    fn link_pointer_resolves_to_its_own_window() {
        let mut disk = Disk::new();
        let mbr = disk.sector(0);
        write_entry(mbr, 0, EXTENDED_LBA, 100, 150);
        sign(mbr);
        let link = disk.sector(100);
        write_entry(link, 0, 0x83, 101, 10);
        write_entry(link, 1, EXTENDED_CHS, 150, 40);
        sign(link);
        let next = disk.sector(150);
        write_entry(next, 0, 0x83, 151, 8);
        sign(next);
        let volume = disk.volume();

        assert_eq!(
            resolve(&volume, 6).unwrap(),
            ExportWindow {
                offset: 150 * 512,
                length: 40 * 512,
            }
        );
        // The pointer is still followed.
        assert_eq!(resolve(&volume, 9).unwrap().offset, 151 * 512);
    }

    #[test]
    fn unsigned_link_is_still_decoded() {
        let mut disk = Disk::new();
        let mbr = disk.sector(0);
        write_entry(mbr, 0, EXTENDED_LBA, 100, 50);
        sign(mbr);
        write_entry(disk.sector(100), 0, 0x83, 101, 7);
        let volume = disk.volume();

        assert_eq!(
            resolve(&volume, 5).unwrap(),
            ExportWindow {
                offset: 101 * 512,
                length: 7 * 512,
            }
        );
    }

    #[test]
    fn unreadable_link_is_read_error() {
        let mut disk = Disk::new();
        let mbr = disk.sector(0);
        write_entry(mbr, 0, EXTENDED_LBA, 10_000, 10);
        sign(mbr);
        let volume = disk.volume();

        assert!(matches!(
            resolve(&volume, 5),
            Err(PartitionError::Read { sector: 10_000, .. })
        ));
    }
}
