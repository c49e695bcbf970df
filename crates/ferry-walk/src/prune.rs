//! Removal of directories emptied by a move.

use std::io;
use std::path::Path;

use ferry_core::Filesystem;

/// Remove `root` and every directory below it that holds no files.
///
/// Directories that still contain files are left alone. Returns `true` if
/// `root` itself was removed. A `root` that is not a directory is ignored.
pub fn prune_empty_dirs(fs: &dyn Filesystem, root: &Path) -> io::Result<bool> {
    let entry = match fs.stat(root) {
        Ok(entry) => entry,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if !entry.is_dir() {
        return Ok(false);
    }

    let mut remaining = 0usize;
    for child in fs.list(root)? {
        if child.is_dir() && prune_empty_dirs(fs, &child.absolute)? {
            continue;
        }
        remaining += 1;
    }

    if remaining > 0 {
        return Ok(false);
    }

    fs.remove(root)?;
    tracing::debug!(target: "ferry::walk", path = %root.display(), "pruned empty directory");
    Ok(true)
}
