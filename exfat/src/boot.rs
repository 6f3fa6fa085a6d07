//! Main boot record parsing and the mount-time consistency checks.

use crate::MountError;

/// The main boot record occupies the first 512 bytes of the image even
/// when the volume uses larger sectors.
pub(crate) const BOOT_RECORD_LEN: usize = 512;

#[derive(Debug, Clone, Copy)]
pub(crate) struct BootRecord {
    pub fat_offset: u32,
    pub cluster_heap_offset: u32,
    pub cluster_count: u32,
    pub root_cluster: u32,
    pub bytes_per_sector_shift: u8,
    pub sectors_per_cluster_shift: u8,
}

impl BootRecord {
    /// Decode and validate the boot record. Anything that does not carry
    /// the exFAT name is `Unsupported`; a named volume that fails any of
    /// the structural checks is `FsckFail`.
    pub fn parse(sector: &[u8]) -> Result<BootRecord, MountError> {
        if sector.len() < BOOT_RECORD_LEN {
            return Err(MountError::FsckFail("main boot record is truncated"));
        }
        if &sector[3..11] != b"EXFAT   " {
            return Err(MountError::Unsupported);
        }
        if sector[11..64].iter().any(|&b| b != 0) {
            return Err(MountError::FsckFail("MustBeZero region is not zero"));
        }
        if u16::from_le_bytes([sector[510], sector[511]]) != 0xAA55 {
            return Err(MountError::FsckFail("bad boot signature"));
        }

        let record = BootRecord {
            fat_offset: le32(sector, 80),
            cluster_heap_offset: le32(sector, 88),
            cluster_count: le32(sector, 92),
            root_cluster: le32(sector, 96),
            bytes_per_sector_shift: sector[108],
            sectors_per_cluster_shift: sector[109],
        };

        if !(9..=12).contains(&record.bytes_per_sector_shift) {
            return Err(MountError::FsckFail("BytesPerSectorShift out of range"));
        }
        if record.sectors_per_cluster_shift > 25 - record.bytes_per_sector_shift {
            return Err(MountError::FsckFail("SectorsPerClusterShift out of range"));
        }
        if record.cluster_count == 0
            || record.root_cluster < 2
            || record.root_cluster > record.cluster_count + 1
        {
            return Err(MountError::FsckFail("root directory cluster out of range"));
        }
        if record.fat_offset == 0 || record.cluster_heap_offset == 0 {
            return Err(MountError::FsckFail("FAT or cluster heap overlaps the boot region"));
        }

        Ok(record)
    }

    pub fn bytes_per_sector(&self) -> u64 {
        1u64 << self.bytes_per_sector_shift
    }

    pub fn cluster_size(&self) -> u64 {
        1u64 << (self.bytes_per_sector_shift + self.sectors_per_cluster_shift)
    }

    /// Byte offset of a cluster's data. Cluster numbering starts at 2.
    pub fn cluster_offset(&self, cluster: u32) -> u64 {
        self.cluster_heap_offset as u64 * self.bytes_per_sector()
            + (cluster as u64 - 2) * self.cluster_size()
    }

    /// Byte offset of a cluster's 32-bit FAT entry.
    pub fn fat_entry_offset(&self, cluster: u32) -> u64 {
        self.fat_offset as u64 * self.bytes_per_sector() + cluster as u64 * 4
    }
}

fn le32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}
