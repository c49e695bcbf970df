//! Resolved source entries.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use compact_str::CompactString;
use serde::{Deserialize, Serialize};

/// Type of a resolved entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    /// Regular file.
    File,
    /// Directory. Only empty directories end up in an operation's sources.
    Directory,
    /// Symbolic link (never followed).
    Symlink,
    /// Other file types (sockets, devices, etc.).
    Other,
}

impl EntryKind {
    /// Check if this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, EntryKind::Directory)
    }

    /// Check if this is a regular file.
    pub fn is_file(&self) -> bool {
        matches!(self, EntryKind::File)
    }
}

/// One concrete filesystem entry discovered under a requested root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Final path component.
    pub name: CompactString,
    /// Path relative to the parent of the requested root.
    ///
    /// Joining this onto an operation's destination yields the target path.
    pub path: PathBuf,
    /// Absolute source path.
    pub absolute: PathBuf,
    /// Size in bytes (0 for directories).
    pub size: u64,
    /// Unix permission bits (0 where unavailable).
    pub mode: u32,
    /// Last modification time.
    pub modified: SystemTime,
    /// Entry type.
    pub kind: EntryKind,
}

impl FileEntry {
    /// Create an entry whose relative path is just its own name.
    pub fn new(
        absolute: impl Into<PathBuf>,
        size: u64,
        mode: u32,
        modified: SystemTime,
        kind: EntryKind,
    ) -> Self {
        let absolute = absolute.into();
        let name: CompactString = absolute
            .file_name()
            .map(|n| n.to_string_lossy().as_ref().into())
            .unwrap_or_default();
        Self {
            path: PathBuf::from(name.as_str()),
            name,
            absolute,
            size,
            mode,
            modified,
            kind,
        }
    }

    /// Return a copy of this entry re-rooted under `relative`.
    pub fn with_relative(mut self, relative: impl Into<PathBuf>) -> Self {
        self.path = relative.into();
        self
    }

    /// The path this entry lands on inside `destination`.
    pub fn target_in(&self, destination: &Path) -> PathBuf {
        destination.join(&self.path)
    }

    /// Check if this entry is a directory.
    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_uses_file_name_as_relative_path() {
        let entry = FileEntry::new("/a/f1", 100, 0o644, SystemTime::UNIX_EPOCH, EntryKind::File);
        assert_eq!(entry.name.as_str(), "f1");
        assert_eq!(entry.path, PathBuf::from("f1"));
        assert_eq!(entry.target_in(Path::new("/b")), PathBuf::from("/b/f1"));
    }

    #[test]
    fn test_with_relative() {
        let entry = FileEntry::new("/a/dir/sub/f", 1, 0, SystemTime::UNIX_EPOCH, EntryKind::File)
            .with_relative("dir/sub/f");
        assert_eq!(entry.target_in(Path::new("/b")), PathBuf::from("/b/dir/sub/f"));
    }
}
