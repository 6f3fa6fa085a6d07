//! Read-only access to exFAT volume images.
//!
//! The shell never touches the host file system for the programs it runs;
//! everything comes out of a mounted image through the narrow [`Volume`]
//! interface below. [`ExfatVolume`] is the real driver, [`MemVolume`] is an
//! in-memory stand-in for tests and demos.

use std::io;

use thiserror::Error;

mod boot;
mod image;
mod mem;

pub use image::ExfatVolume;
pub use mem::MemVolume;

/// Opaque handle to an open file or directory on a volume.
///
/// Handles are plain table indices, cheap to copy and only meaningful to
/// the volume that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub(crate) u32);

/// One directory entry as reported by [`Volume::next_entry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub inode: u64,
    pub name: String,
    pub is_dir: bool,
}

/// Why a volume image could not be mounted.
#[derive(Debug, Error)]
pub enum MountError {
    /// The image is not an exFAT volume at all.
    #[error("not an exFAT volume")]
    Unsupported,
    /// The image claims to be exFAT but fails the consistency checks.
    #[error("file system check failed: {0}")]
    FsckFail(&'static str),
    /// The source could not be used as a volume image.
    #[error("cannot use volume source: {0}")]
    Invalid(#[from] io::Error),
}

/// Errors reported by an already-mounted volume.
#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("no such file or directory")]
    NotFound,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsDirectory,
    #[error("bad volume handle")]
    BadHandle,
    #[error("volume is corrupted: {0}")]
    Corrupt(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The contract every mounted volume offers the shell.
///
/// Paths are absolute, `/`-separated strings. Reads are cursor-based and
/// return 0 at end of file; directory listing is a finite, non-restartable
/// entry stream that fails with [`VolumeError::NotADirectory`] on file
/// handles, including on the very first call.
pub trait Volume {
    /// The label recorded on the medium.
    fn label(&self) -> &str;

    /// Open the file or directory at an absolute path.
    fn open(&mut self, path: &str) -> Result<Handle, VolumeError>;

    /// Read file bytes at the handle's cursor, advancing it.
    fn read(&mut self, handle: Handle, buf: &mut [u8]) -> Result<usize, VolumeError>;

    /// The next directory entry, or `None` once the directory is exhausted.
    fn next_entry(&mut self, handle: Handle) -> Result<Option<DirEntry>, VolumeError>;

    /// Release a handle. Unknown handles are ignored.
    fn close(&mut self, handle: Handle);
}
