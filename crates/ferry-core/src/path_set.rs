//! Normalized, de-duplicated collections of source paths.

use std::path::{Component, Path, PathBuf};

use indexmap::IndexSet;

/// An insertion-ordered set of lexically normalized paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathSet {
    paths: IndexSet<PathBuf>,
}

impl PathSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a path after normalizing it. Returns `true` if it was new.
    pub fn insert(&mut self, path: impl AsRef<Path>) -> bool {
        let normalized = normalize(path.as_ref());
        if normalized.as_os_str().is_empty() {
            return false;
        }
        self.paths.insert(normalized)
    }

    /// Iterate in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &PathBuf> {
        self.paths.iter()
    }

    /// Number of distinct paths.
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// Check if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Consume into an ordered vector.
    pub fn into_vec(self) -> Vec<PathBuf> {
        self.paths.into_iter().collect()
    }
}

impl<P: AsRef<Path>> FromIterator<P> for PathSet {
    fn from_iter<I: IntoIterator<Item = P>>(iter: I) -> Self {
        let mut set = Self::new();
        for path in iter {
            set.insert(path);
        }
        set
    }
}

impl<P: AsRef<Path>> Extend<P> for PathSet {
    fn extend<I: IntoIterator<Item = P>>(&mut self, iter: I) {
        for path in iter {
            self.insert(path);
        }
    }
}

/// Lexically normalize a path without touching the filesystem.
///
/// Drops `.` components, folds `..` into its parent and strips trailing
/// separators. `..` above the root of an absolute path is discarded.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let at_root = matches!(
                    out.components().next_back(),
                    None | Some(Component::RootDir) | Some(Component::Prefix(_))
                );
                if !at_root && !out.ends_with("..") {
                    out.pop();
                } else if !path.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
