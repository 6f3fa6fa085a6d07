//! An in-memory volume.
//!
//! Serves files straight out of a map, with the same handle-table shape as
//! the real driver. Tests build one with a few `add_dir`/`add_file` calls
//! instead of synthesizing a whole image.

use std::collections::{BTreeMap, HashMap};

use crate::{DirEntry, Handle, Volume, VolumeError};

enum MemNode {
    File(Vec<u8>),
    Dir,
}

struct MemHandle {
    path: String,
    is_dir: bool,
    /// Byte position for files, child index for directories.
    pos: usize,
}

pub struct MemVolume {
    label: String,
    nodes: BTreeMap<String, MemNode>,
    next: u32,
    handles: HashMap<u32, MemHandle>,
}

impl MemVolume {
    pub fn new(label: &str) -> MemVolume {
        let mut nodes = BTreeMap::new();
        nodes.insert(String::from("/"), MemNode::Dir);
        MemVolume {
            label: label.to_string(),
            nodes,
            next: 1,
            handles: HashMap::new(),
        }
    }

    /// Register a directory at an absolute path.
    pub fn add_dir(&mut self, path: &str) -> &mut MemVolume {
        self.nodes.insert(normalize(path), MemNode::Dir);
        self
    }

    /// Register a file at an absolute path.
    pub fn add_file(&mut self, path: &str, data: impl Into<Vec<u8>>) -> &mut MemVolume {
        self.nodes.insert(normalize(path), MemNode::File(data.into()));
        self
    }

    /// Names directly under `dir`, in map order.
    fn children(&self, dir: &str) -> Vec<(String, bool)> {
        self.nodes
            .iter()
            .filter(|(path, _)| path.as_str() != "/" && parent_of(path) == dir)
            .map(|(path, node)| {
                let name = path.rsplit('/').next().unwrap_or("").to_string();
                (name, matches!(node, MemNode::Dir))
            })
            .collect()
    }

    fn inode_of(&self, dir: &str, name: &str) -> u64 {
        let full = if dir == "/" {
            format!("/{name}")
        } else {
            format!("{dir}/{name}")
        };
        self.nodes
            .keys()
            .position(|k| k == &full)
            .map(|p| p as u64 + 1)
            .unwrap_or(0)
    }
}

fn normalize(path: &str) -> String {
    if path != "/" && path.ends_with('/') {
        path[..path.len() - 1].to_string()
    } else {
        path.to_string()
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(at) => &path[..at],
        None => "/",
    }
}

impl Volume for MemVolume {
    fn label(&self) -> &str {
        &self.label
    }

    fn open(&mut self, path: &str) -> Result<Handle, VolumeError> {
        let path = normalize(path);
        let node = self.nodes.get(&path).ok_or(VolumeError::NotFound)?;
        let is_dir = matches!(node, MemNode::Dir);
        let id = self.next;
        self.next += 1;
        self.handles.insert(
            id,
            MemHandle {
                path,
                is_dir,
                pos: 0,
            },
        );
        Ok(Handle(id))
    }

    fn read(&mut self, handle: Handle, buf: &mut [u8]) -> Result<usize, VolumeError> {
        let open = self.handles.get_mut(&handle.0).ok_or(VolumeError::BadHandle)?;
        if open.is_dir {
            return Err(VolumeError::IsDirectory);
        }
        let data = match self.nodes.get(&open.path) {
            Some(MemNode::File(data)) => data,
            _ => return Err(VolumeError::NotFound),
        };
        if open.pos >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - open.pos);
        buf[..n].copy_from_slice(&data[open.pos..open.pos + n]);
        open.pos += n;
        Ok(n)
    }

    fn next_entry(&mut self, handle: Handle) -> Result<Option<DirEntry>, VolumeError> {
        let open = self.handles.get(&handle.0).ok_or(VolumeError::BadHandle)?;
        if !open.is_dir {
            return Err(VolumeError::NotADirectory);
        }
        let dir = open.path.clone();
        let index = open.pos;
        let children = self.children(&dir);
        let Some((name, is_dir)) = children.get(index).cloned() else {
            return Ok(None);
        };
        let inode = self.inode_of(&dir, &name);
        if let Some(open) = self.handles.get_mut(&handle.0) {
            open.pos += 1;
        }
        Ok(Some(DirEntry { inode, name, is_dir }))
    }

    fn close(&mut self, handle: Handle) {
        self.handles.remove(&handle.0);
    }
}
