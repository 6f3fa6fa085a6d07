//! Builds small synthetic exFAT images for the driver tests.
//!
//! Fixed geometry: 512-byte sectors, one sector per cluster, FAT in
//! sector 1, cluster heap from sector 2. Cluster 2 is reserved for the
//! root directory; everything else is allocated upward from cluster 3.

use std::io::Write;

use tempfile::NamedTempFile;

pub const SECTOR: usize = 512;
pub const CLUSTER_COUNT: u32 = 64;
pub const FAT_END: u32 = 0xFFFF_FFFF;

pub struct ImageBuilder {
    /// Cluster heap, index 0 holds cluster 2.
    heap: Vec<[u8; SECTOR]>,
    fat: Vec<u32>,
}

impl ImageBuilder {
    pub fn new() -> ImageBuilder {
        let mut fat = vec![0u32; 128];
        fat[0] = 0xFFFF_FFF8;
        fat[1] = 0xFFFF_FFFF;
        fat[2] = FAT_END; // root directory, single cluster
        ImageBuilder {
            heap: vec![[0u8; SECTOR]],
            fat,
        }
    }

    /// Claim the next free cluster and fill it with `data` (padded).
    pub fn alloc_cluster(&mut self, data: &[u8]) -> u32 {
        assert!(data.len() <= SECTOR);
        let mut sector = [0u8; SECTOR];
        sector[..data.len()].copy_from_slice(data);
        self.heap.push(sector);
        let cluster = self.heap.len() as u32 + 1;
        self.fat[cluster as usize] = FAT_END;
        cluster
    }

    /// Point cluster `from`'s FAT entry at `to`.
    pub fn link(&mut self, from: u32, to: u32) {
        self.fat[from as usize] = to;
    }

    /// Store `data` across as many clusters as needed, FAT-chained in
    /// allocation order. Returns the first cluster.
    pub fn alloc_chain(&mut self, data: &[u8]) -> u32 {
        let mut chunks = data.chunks(SECTOR);
        let first = self.alloc_cluster(chunks.next().unwrap_or(&[]));
        let mut previous = first;
        for chunk in chunks {
            let cluster = self.alloc_cluster(chunk);
            self.link(previous, cluster);
            previous = cluster;
        }
        first
    }

    /// Write the root directory's raw entries (at most one cluster) and
    /// produce the final image bytes.
    pub fn build(mut self, root_entries: &[u8]) -> Vec<u8> {
        assert!(root_entries.len() <= SECTOR);
        self.heap[0][..root_entries.len()].copy_from_slice(root_entries);

        let mut image = Vec::new();
        image.extend_from_slice(&boot_sector());
        for entry in &self.fat {
            image.extend_from_slice(&entry.to_le_bytes());
        }
        for sector in &self.heap {
            image.extend_from_slice(sector);
        }
        image
    }
}

pub fn boot_sector() -> [u8; SECTOR] {
    let mut sector = [0u8; SECTOR];
    sector[0..3].copy_from_slice(&[0xEB, 0x76, 0x90]);
    sector[3..11].copy_from_slice(b"EXFAT   ");
    sector[80..84].copy_from_slice(&1u32.to_le_bytes()); // fat_offset
    sector[84..88].copy_from_slice(&1u32.to_le_bytes()); // fat_length
    sector[88..92].copy_from_slice(&2u32.to_le_bytes()); // cluster_heap_offset
    sector[92..96].copy_from_slice(&CLUSTER_COUNT.to_le_bytes());
    sector[96..100].copy_from_slice(&2u32.to_le_bytes()); // root directory
    sector[108] = 9; // 512-byte sectors
    sector[109] = 0; // one sector per cluster
    sector[110] = 1; // one FAT
    sector[510] = 0x55;
    sector[511] = 0xAA;
    sector
}

/// A volume-label directory entry (type 0x83).
pub fn label_entry(label: &str) -> Vec<u8> {
    let units: Vec<u16> = label.encode_utf16().collect();
    assert!(units.len() <= 11);
    let mut entry = [0u8; 32];
    entry[0] = 0x83;
    entry[1] = units.len() as u8;
    for (k, unit) in units.iter().enumerate() {
        entry[2 + 2 * k..4 + 2 * k].copy_from_slice(&unit.to_le_bytes());
    }
    entry.to_vec()
}

/// A file or directory entry set (0x85 + 0xC0 + 0xC1...).
pub fn file_entry(name: &str, first_cluster: u32, size: u64, is_dir: bool) -> Vec<u8> {
    let units: Vec<u16> = name.encode_utf16().collect();
    let name_entries = units.len().div_ceil(15).max(1);

    let mut out = Vec::new();

    let mut file = [0u8; 32];
    file[0] = 0x85;
    file[1] = (1 + name_entries) as u8;
    let attributes: u16 = if is_dir { 0x10 } else { 0 };
    file[4..6].copy_from_slice(&attributes.to_le_bytes());
    out.extend_from_slice(&file);

    let mut stream = [0u8; 32];
    stream[0] = 0xC0;
    stream[1] = 0x01; // allocation possible, FAT chain in use
    stream[3] = units.len() as u8;
    stream[8..16].copy_from_slice(&size.to_le_bytes()); // valid data length
    stream[20..24].copy_from_slice(&first_cluster.to_le_bytes());
    stream[24..32].copy_from_slice(&size.to_le_bytes());
    out.extend_from_slice(&stream);

    for chunk in units.chunks(15) {
        let mut name_entry = [0u8; 32];
        name_entry[0] = 0xC1;
        for (k, unit) in chunk.iter().enumerate() {
            name_entry[2 + 2 * k..4 + 2 * k].copy_from_slice(&unit.to_le_bytes());
        }
        out.extend_from_slice(&name_entry);
    }
    if units.is_empty() {
        let mut name_entry = [0u8; 32];
        name_entry[0] = 0xC1;
        out.extend_from_slice(&name_entry);
    }
    out
}

pub fn write_image(bytes: &[u8]) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp image");
    file.write_all(bytes).expect("write image");
    file.flush().expect("flush image");
    file
}
