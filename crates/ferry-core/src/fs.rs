//! The filesystem capability the engine drives, and its local-disk implementation.

use std::fs::{self, File, Metadata, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;
use std::time::UNIX_EPOCH;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use jwalk::WalkDir;
use thiserror::Error;

use crate::entry::{EntryKind, FileEntry};

/// Failure of a streaming copy, split by the side that failed.
#[derive(Debug, Error)]
pub enum CopyError {
    /// Opening or reading the source failed.
    #[error("Failed to read source: {0}")]
    Source(#[source] io::Error),

    /// Creating or writing the destination failed.
    #[error("Failed to write destination: {0}")]
    Destination(#[source] io::Error),

    /// The [`CopyControl`] stopped the copy.
    #[error("Copy stopped: {0}")]
    Stopped(#[source] io::Error),
}

impl CopyError {
    /// The underlying I/O error.
    pub fn io(&self) -> &io::Error {
        match self {
            Self::Source(e) | Self::Destination(e) | Self::Stopped(e) => e,
        }
    }
}

/// Receives control after every chunk of a streaming copy.
pub trait CopyControl {
    /// Bytes to move in the next chunk.
    fn chunk_size(&self) -> usize;

    /// Called after each chunk with the running total of copied bytes.
    ///
    /// Returning an error stops the copy; it is handed back to the caller of
    /// [`Filesystem::copy`] as [`CopyError::Stopped`].
    fn on_chunk(&mut self, copied: u64) -> io::Result<()>;
}

/// Blocking filesystem operations the engine needs.
///
/// All paths are absolute. Implementations must be safe to share between
/// threads; the engine calls them from blocking worker threads.
pub trait Filesystem: Send + Sync + 'static {
    /// Entries directly inside a directory, in no particular order.
    fn list(&self, path: &Path) -> io::Result<Vec<FileEntry>>;

    /// Metadata of a single path. Symlinks are not followed.
    fn stat(&self, path: &Path) -> io::Result<FileEntry>;

    /// Check if anything occupies `path`.
    fn exists(&self, path: &Path) -> bool {
        self.stat(path).is_ok()
    }

    /// Create a directory and any missing parents.
    fn mkdir(&self, path: &Path) -> io::Result<()>;

    /// Remove a file, or a directory with everything in it.
    fn remove(&self, path: &Path) -> io::Result<()>;

    /// Rename `src` to `dst`. May fail across devices.
    fn rename(&self, src: &Path, dst: &Path) -> io::Result<()>;

    /// Stream a regular file to a new path.
    ///
    /// Fails with [`CopyError::Destination`] of kind
    /// [`io::ErrorKind::AlreadyExists`] if `dst` exists. A partially written
    /// `dst` is left in place when the copy fails.
    fn copy(
        &self,
        src: &Path,
        dst: &Path,
        control: &mut dyn CopyControl,
    ) -> Result<u64, CopyError>;

    /// Total size of a file or directory tree. May be expensive.
    fn size_of(&self, path: &Path) -> io::Result<u64>;
}

/// [`Filesystem`] backed by the local disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFs;

impl Filesystem for LocalFs {
    fn list(&self, path: &Path) -> io::Result<Vec<FileEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            entries.push(entry_from_metadata(&entry.path(), &metadata));
        }
        Ok(entries)
    }

    fn stat(&self, path: &Path) -> io::Result<FileEntry> {
        let metadata = fs::symlink_metadata(path)?;
        Ok(entry_from_metadata(path, &metadata))
    }

    fn exists(&self, path: &Path) -> bool {
        fs::symlink_metadata(path).is_ok()
    }

    fn mkdir(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        let metadata = fs::symlink_metadata(path)?;
        if metadata.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        }
    }

    fn rename(&self, src: &Path, dst: &Path) -> io::Result<()> {
        fs::rename(src, dst)
    }

    fn copy(
        &self,
        src: &Path,
        dst: &Path,
        control: &mut dyn CopyControl,
    ) -> Result<u64, CopyError> {
        let mut reader = File::open(src).map_err(CopyError::Source)?;
        let permissions = reader.metadata().map_err(CopyError::Source)?.permissions();
        let mut writer = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dst)
            .map_err(CopyError::Destination)?;

        let mut buf = Vec::new();
        let mut copied = 0u64;
        loop {
            let want = control.chunk_size().max(1);
            buf.resize(want, 0);
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(CopyError::Source(e)),
            };
            writer.write_all(&buf[..n]).map_err(CopyError::Destination)?;
            copied += n as u64;
            control.on_chunk(copied).map_err(CopyError::Stopped)?;
        }

        writer.flush().map_err(CopyError::Destination)?;
        // Best effort, some filesystems reject permission changes.
        let _ = fs::set_permissions(dst, permissions);
        Ok(copied)
    }

    fn size_of(&self, path: &Path) -> io::Result<u64> {
        let metadata = fs::symlink_metadata(path)?;
        if !metadata.is_dir() {
            return Ok(metadata.len());
        }

        let total = WalkDir::new(path)
            .skip_hidden(false)
            .follow_links(false)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| entry.metadata().ok())
            .map(|m| m.len())
            .sum();
        Ok(total)
    }
}

fn entry_from_metadata(path: &Path, metadata: &Metadata) -> FileEntry {
    let file_type = metadata.file_type();
    let kind = if file_type.is_symlink() {
        EntryKind::Symlink
    } else if file_type.is_dir() {
        EntryKind::Directory
    } else if file_type.is_file() {
        EntryKind::File
    } else {
        EntryKind::Other
    };
    let size = if kind.is_file() { metadata.len() } else { 0 };

    FileEntry::new(
        path,
        size,
        mode_of(metadata),
        metadata.modified().unwrap_or(UNIX_EPOCH),
        kind,
    )
}

#[cfg(unix)]
fn mode_of(metadata: &Metadata) -> u32 {
    metadata.permissions().mode()
}

#[cfg(not(unix))]
fn mode_of(_metadata: &Metadata) -> u32 {
    0
}
