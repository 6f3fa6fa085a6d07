//! The exFAT read driver.
//!
//! All image access goes through positioned reads (`pread`) so that open
//! handles keep their cursors in process memory; a forked child inherits a
//! private copy of the handle table and never races the parent on a shared
//! kernel file offset.

use std::collections::HashMap;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::boot::{BootRecord, BOOT_RECORD_LEN};
use crate::{DirEntry, Handle, MountError, Volume, VolumeError};

const DIRENT_SIZE: u64 = 32;

const ENTRY_END: u8 = 0x00;
const ENTRY_VOLUME_LABEL: u8 = 0x83;
const ENTRY_FILE: u8 = 0x85;
const ENTRY_STREAM: u8 = 0xC0;
const ENTRY_NAME: u8 = 0xC1;

const ATTR_DIRECTORY: u16 = 0x10;
const FLAG_NO_FAT_CHAIN: u8 = 0x02;
/// 0xFFFFFFF8..=0xFFFFFFFF all terminate a chain (end marker and media
/// descriptors); 0xFFFFFFF7 marks a bad cluster and is treated as corrupt.
const FAT_CHAIN_END: u32 = 0xFFFF_FFF8;
const NAME_CHARS_PER_ENTRY: usize = 15;

/// An open file or directory: its resolved cluster run, byte size, and a
/// cursor (byte position for files, raw entry index for directories).
struct Node {
    clusters: Vec<u32>,
    size: u64,
    pos: u64,
    is_dir: bool,
}

/// A directory record as stored on disk, before it is reduced to the
/// public [`DirEntry`] shape.
struct RawEntry {
    name: String,
    is_dir: bool,
    first_cluster: u32,
    size: u64,
    no_fat_chain: bool,
}

pub struct ExfatVolume {
    image: File,
    boot: BootRecord,
    label: String,
    next: u32,
    handles: HashMap<u32, Node>,
}

impl ExfatVolume {
    /// Validate the image's main boot record and prepare the volume for
    /// reading. Nothing else on the image is trusted until the checks in
    /// [`BootRecord::parse`] pass.
    pub fn mount<P: AsRef<Path>>(source: P) -> Result<ExfatVolume, MountError> {
        let image = File::open(source)?;
        let mut sector = [0u8; BOOT_RECORD_LEN];
        image
            .read_exact_at(&mut sector, 0)
            .map_err(|_| MountError::FsckFail("main boot record is truncated"))?;
        let boot = BootRecord::parse(&sector)?;

        let mut volume = ExfatVolume {
            image,
            boot,
            label: String::new(),
            next: 1,
            handles: HashMap::new(),
        };
        volume.label = volume
            .read_label()
            .map_err(|_| MountError::FsckFail("unreadable root directory"))?;
        Ok(volume)
    }

    /// Follow a FAT chain from `first`, guarding against cycles and
    /// out-of-range links on corrupted images.
    fn chain_from_fat(&self, first: u32) -> Result<Vec<u32>, VolumeError> {
        let mut clusters = Vec::new();
        if first == 0 {
            return Ok(clusters);
        }
        let mut current = first;
        loop {
            if current < 2 || current > self.boot.cluster_count + 1 {
                return Err(VolumeError::Corrupt("cluster link out of range"));
            }
            clusters.push(current);
            if clusters.len() as u64 > self.boot.cluster_count as u64 {
                return Err(VolumeError::Corrupt("FAT chain does not terminate"));
            }
            let mut raw = [0u8; 4];
            self.image
                .read_exact_at(&mut raw, self.boot.fat_entry_offset(current))?;
            let next = u32::from_le_bytes(raw);
            if next >= FAT_CHAIN_END {
                break;
            }
            current = next;
        }
        Ok(clusters)
    }

    fn root_node(&self) -> Result<Node, VolumeError> {
        let clusters = self.chain_from_fat(self.boot.root_cluster)?;
        let size = clusters.len() as u64 * self.boot.cluster_size();
        Ok(Node {
            clusters,
            size,
            pos: 0,
            is_dir: true,
        })
    }

    fn node_from_record(&self, record: &RawEntry) -> Result<Node, VolumeError> {
        let cluster_size = self.boot.cluster_size();
        let clusters = if record.no_fat_chain {
            let count = record.size.div_ceil(cluster_size);
            (0..count as u32).map(|k| record.first_cluster + k).collect()
        } else {
            self.chain_from_fat(record.first_cluster)?
        };
        let size = if record.is_dir && record.size == 0 {
            clusters.len() as u64 * cluster_size
        } else {
            record.size
        };
        Ok(Node {
            clusters,
            size,
            pos: 0,
            is_dir: record.is_dir,
        })
    }

    /// Read node bytes at a logical position, across cluster boundaries.
    /// Returns less than `buf.len()` only at end of data.
    fn read_node_at(&self, node: &Node, pos: u64, buf: &mut [u8]) -> Result<usize, VolumeError> {
        if pos >= node.size {
            return Ok(0);
        }
        let want = buf.len().min((node.size - pos) as usize);
        let cluster_size = self.boot.cluster_size();
        let mut done = 0usize;
        while done < want {
            let logical = pos + done as u64;
            let index = (logical / cluster_size) as usize;
            let within = logical % cluster_size;
            let Some(&cluster) = node.clusters.get(index) else {
                return Err(VolumeError::Corrupt("cluster chain shorter than data size"));
            };
            let take = ((cluster_size - within) as usize).min(want - done);
            let offset = self.boot.cluster_offset(cluster) + within;
            self.image.read_exact_at(&mut buf[done..done + take], offset)?;
            done += take;
        }
        Ok(want)
    }

    fn read_dirent(&self, node: &Node, index: u64) -> Result<Option<[u8; 32]>, VolumeError> {
        let mut raw = [0u8; 32];
        let n = self.read_node_at(node, index * DIRENT_SIZE, &mut raw)?;
        if n < raw.len() {
            return Ok(None);
        }
        Ok(Some(raw))
    }

    /// Decode the next file/directory entry set at `*cursor` (a raw entry
    /// index), skipping label, bitmap, up-case table, and deleted entries.
    /// The cursor is left on the end marker when the directory is done.
    fn scan_dir_record(
        &self,
        node: &Node,
        cursor: &mut u64,
    ) -> Result<Option<RawEntry>, VolumeError> {
        loop {
            let raw = match self.read_dirent(node, *cursor)? {
                Some(raw) => raw,
                None => return Ok(None),
            };
            if raw[0] == ENTRY_END {
                return Ok(None);
            }
            *cursor += 1;
            if raw[0] != ENTRY_FILE {
                continue;
            }

            let secondary_count = raw[1] as u64;
            let attributes = u16::from_le_bytes([raw[4], raw[5]]);
            if secondary_count == 0 {
                return Err(VolumeError::Corrupt("file entry without stream extension"));
            }

            let stream = match self.read_dirent(node, *cursor)? {
                Some(raw) if raw[0] == ENTRY_STREAM => raw,
                _ => return Err(VolumeError::Corrupt("file entry without stream extension")),
            };
            *cursor += 1;
            let no_fat_chain = stream[1] & FLAG_NO_FAT_CHAIN != 0;
            let name_length = stream[3] as usize;
            let first_cluster = u32::from_le_bytes([stream[20], stream[21], stream[22], stream[23]]);
            let size = u64::from_le_bytes([
                stream[24], stream[25], stream[26], stream[27], stream[28], stream[29], stream[30],
                stream[31],
            ]);

            let mut units: Vec<u16> = Vec::with_capacity(name_length);
            for _ in 1..secondary_count {
                let secondary = match self.read_dirent(node, *cursor)? {
                    Some(raw) => raw,
                    None => return Err(VolumeError::Corrupt("truncated file entry set")),
                };
                *cursor += 1;
                if secondary[0] != ENTRY_NAME {
                    continue;
                }
                for k in 0..NAME_CHARS_PER_ENTRY {
                    let at = 2 + 2 * k;
                    units.push(u16::from_le_bytes([secondary[at], secondary[at + 1]]));
                }
            }
            if units.len() < name_length {
                return Err(VolumeError::Corrupt("file name shorter than declared"));
            }
            units.truncate(name_length);

            return Ok(Some(RawEntry {
                name: String::from_utf16_lossy(&units),
                is_dir: attributes & ATTR_DIRECTORY != 0,
                first_cluster,
                size,
                no_fat_chain,
            }));
        }
    }

    /// Walk an absolute path from the root directory. Name comparison is
    /// ASCII-case-insensitive (the driver does not read the up-case table).
    fn resolve(&self, path: &str) -> Result<Node, VolumeError> {
        if !path.starts_with('/') {
            return Err(VolumeError::NotFound);
        }
        let mut node = self.root_node()?;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            if !node.is_dir {
                return Err(VolumeError::NotFound);
            }
            let mut cursor = 0u64;
            let mut found = None;
            while let Some(record) = self.scan_dir_record(&node, &mut cursor)? {
                if record.name.eq_ignore_ascii_case(component) {
                    found = Some(record);
                    break;
                }
            }
            let record = found.ok_or(VolumeError::NotFound)?;
            node = self.node_from_record(&record)?;
        }
        Ok(node)
    }

    fn read_label(&self) -> Result<String, VolumeError> {
        let root = self.root_node()?;
        let mut index = 0u64;
        while let Some(raw) = self.read_dirent(&root, index)? {
            match raw[0] {
                ENTRY_END => break,
                ENTRY_VOLUME_LABEL => {
                    let count = (raw[1] as usize).min(11);
                    let units: Vec<u16> = (0..count)
                        .map(|k| u16::from_le_bytes([raw[2 + 2 * k], raw[3 + 2 * k]]))
                        .collect();
                    return Ok(String::from_utf16_lossy(&units).trim_end().to_string());
                }
                _ => {}
            }
            index += 1;
        }
        Ok(String::from("NO NAME"))
    }
}

impl Volume for ExfatVolume {
    fn label(&self) -> &str {
        &self.label
    }

    fn open(&mut self, path: &str) -> Result<Handle, VolumeError> {
        let node = self.resolve(path)?;
        let id = self.next;
        self.next += 1;
        self.handles.insert(id, node);
        Ok(Handle(id))
    }

    fn read(&mut self, handle: Handle, buf: &mut [u8]) -> Result<usize, VolumeError> {
        let node = self.handles.get(&handle.0).ok_or(VolumeError::BadHandle)?;
        if node.is_dir {
            return Err(VolumeError::IsDirectory);
        }
        let n = self.read_node_at(node, node.pos, buf)?;
        if let Some(node) = self.handles.get_mut(&handle.0) {
            node.pos += n as u64;
        }
        Ok(n)
    }

    fn next_entry(&mut self, handle: Handle) -> Result<Option<DirEntry>, VolumeError> {
        let node = self.handles.get(&handle.0).ok_or(VolumeError::BadHandle)?;
        if !node.is_dir {
            return Err(VolumeError::NotADirectory);
        }
        let mut cursor = node.pos;
        let record = self.scan_dir_record(node, &mut cursor)?;
        if let Some(node) = self.handles.get_mut(&handle.0) {
            node.pos = cursor;
        }
        Ok(record.map(|record| DirEntry {
            inode: record.first_cluster as u64,
            name: record.name,
            is_dir: record.is_dir,
        }))
    }

    fn close(&mut self, handle: Handle) {
        self.handles.remove(&handle.0);
    }
}
