//! Depth-first expansion of source roots into concrete entries.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use globset::{Glob, GlobSet, GlobSetBuilder};
use thiserror::Error;

use ferry_core::{EntryKind, FileEntry, Filesystem, WalkConfig};

/// Per-entry problems met while walking. None of them stop the walk.
#[derive(Debug, Error)]
pub enum WalkError {
    /// A root or directory could not be read, e.g. removed mid-walk.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An entry that is never transferred.
    #[error("Skipped {path}: {reason}")]
    Skipped { path: PathBuf, reason: &'static str },

    /// An ignore pattern failed to compile.
    #[error("Invalid ignore pattern: {0}")]
    Pattern(#[from] globset::Error),
}

impl WalkError {
    /// Check if the error means the path does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }

    /// The path the error refers to, if any.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Io { path, .. } | Self::Skipped { path, .. } => Some(path.as_path()),
            Self::Pattern(_) => None,
        }
    }
}

/// Entries and warnings collected from a full walk.
#[derive(Debug, Default)]
pub struct Expansion {
    pub entries: Vec<FileEntry>,
    pub warnings: Vec<WalkError>,
}

/// Expands root paths into the flat list of entries an operation transfers.
///
/// Regular files pass through unchanged, directories are expanded in
/// name order, and directories left with no children after filtering are
/// yielded so they can be recreated. Re-walking an unchanged tree yields the same sequence.
pub struct FileWalker {
    fs: Arc<dyn Filesystem>,
    config: WalkConfig,
    ignore: GlobSet,
}

impl FileWalker {
    /// Create a walker over `fs`.
    pub fn new(fs: Arc<dyn Filesystem>, config: WalkConfig) -> Result<Self, WalkError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &config.ignore_patterns {
            builder.add(Glob::new(pattern)?);
        }
        let ignore = builder.build()?;
        Ok(Self { fs, config, ignore })
    }

    /// Lazily walk `roots` in order.
    pub fn walk<I, P>(&self, roots: I) -> Walk<'_>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Walk {
            walker: self,
            roots: roots.into_iter().map(Into::into).collect(),
            stack: Vec::new(),
        }
    }

    /// Walk `roots` to completion.
    pub fn expand<I, P>(&self, roots: I) -> Expansion
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let mut expansion = Expansion::default();
        for item in self.walk(roots) {
            match item {
                Ok(entry) => expansion.entries.push(entry),
                Err(err) => {
                    tracing::debug!(target: "ferry::walk", "{}", err);
                    expansion.warnings.push(err);
                }
            }
        }
        expansion
    }

    fn is_ignored(&self, name: &str) -> bool {
        self.config.should_skip_hidden(name) || self.ignore.is_match(name)
    }
}

struct Pending {
    entry: FileEntry,
    relative: PathBuf,
    depth: u32,
}

/// Iterator returned by [`FileWalker::walk`].
pub struct Walk<'a> {
    walker: &'a FileWalker,
    roots: VecDeque<PathBuf>,
    stack: Vec<Pending>,
}

impl Walk<'_> {
    fn visit(&mut self, pending: Pending) -> Option<Result<FileEntry, WalkError>> {
        let Pending {
            entry,
            relative,
            depth,
        } = pending;

        match entry.kind {
            EntryKind::File => Some(Ok(entry.with_relative(relative))),
            EntryKind::Symlink => Some(Err(WalkError::Skipped {
                path: entry.absolute,
                reason: "symbolic links are not followed",
            })),
            EntryKind::Other => Some(Err(WalkError::Skipped {
                path: entry.absolute,
                reason: "not a regular file",
            })),
            EntryKind::Directory => {
                if self.walker.config.max_depth.is_some_and(|max| depth >= max) {
                    return None;
                }

                let mut children = match self.walker.fs.list(&entry.absolute) {
                    Ok(children) => children,
                    Err(source) => {
                        return Some(Err(WalkError::Io {
                            path: entry.absolute,
                            source,
                        }));
                    }
                };

                children.retain(|child| !self.walker.is_ignored(&child.name));
                if children.is_empty() {
                    return Some(Ok(entry.with_relative(relative)));
                }

                // Reverse name order so popping yields ascending order.
                children.sort_by(|a, b| b.name.cmp(&a.name));
                for child in children {
                    let child_relative = relative.join(child.name.as_str());
                    self.stack.push(Pending {
                        entry: child,
                        relative: child_relative,
                        depth: depth + 1,
                    });
                }
                None
            }
        }
    }
}

impl Iterator for Walk<'_> {
    type Item = Result<FileEntry, WalkError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let pending = if let Some(pending) = self.stack.pop() {
                pending
            } else {
                let root = self.roots.pop_front()?;
                match self.walker.fs.stat(&root) {
                    Ok(entry) => Pending {
                        relative: PathBuf::from(entry.name.as_str()),
                        entry,
                        depth: 0,
                    },
                    Err(source) => return Some(Err(WalkError::Io { path: root, source })),
                }
            };

            if let Some(item) = self.visit(pending) {
                return Some(item);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::LocalFs;
    use std::fs;
    use tempfile::TempDir;

    fn walker(config: WalkConfig) -> FileWalker {
        FileWalker::new(Arc::new(LocalFs), config).unwrap()
    }

    #[test]
    fn test_depth_first_name_order() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        fs::create_dir_all(root.join("b")).unwrap();
        fs::create_dir_all(root.join("a")).unwrap();
        fs::write(root.join("b/2"), b"22").unwrap();
        fs::write(root.join("a/1"), b"1").unwrap();
        fs::write(root.join("c"), b"333").unwrap();

        let expansion = walker(WalkConfig::default()).expand([&root]);
        let paths: Vec<_> = expansion.entries.iter().map(|e| e.path.clone()).collect();

        assert_eq!(
            paths,
            vec![
                PathBuf::from("root/a/1"),
                PathBuf::from("root/b/2"),
                PathBuf::from("root/c"),
            ]
        );
        assert!(expansion.warnings.is_empty());
    }

    #[test]
    fn test_missing_root_is_per_entry_error() {
        let temp = TempDir::new().unwrap();
        let present = temp.path().join("present");
        fs::write(&present, b"x").unwrap();

        let items: Vec<_> = walker(WalkConfig::default())
            .walk([temp.path().join("gone"), present])
            .collect();

        assert_eq!(items.len(), 2);
        assert!(items[0].as_ref().unwrap_err().is_not_found());
        assert_eq!(items[1].as_ref().unwrap().name.as_str(), "present");
    }

    #[test]
    fn test_empty_directory_is_yielded() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        fs::create_dir_all(root.join("empty")).unwrap();

        let expansion = walker(WalkConfig::default()).expand([&root]);
        assert_eq!(expansion.entries.len(), 1);
        assert!(expansion.entries[0].is_dir());
        assert_eq!(expansion.entries[0].path, PathBuf::from("root/empty"));
    }

    #[test]
    fn test_ignore_patterns_and_hidden() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("keep.txt"), b"k").unwrap();
        fs::write(root.join("drop.log"), b"d").unwrap();
        fs::write(root.join(".hidden"), b"h").unwrap();

        let config = WalkConfig::builder()
            .ignore_patterns(vec!["*.log".to_string()])
            .include_hidden(false)
            .build()
            .unwrap();
        let expansion = walker(config).expand([&root]);

        assert_eq!(expansion.entries.len(), 1);
        assert_eq!(expansion.entries[0].name.as_str(), "keep.txt");
    }

    #[test]
    fn test_directory_with_only_ignored_children_is_yielded() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        fs::create_dir_all(root.join("logs")).unwrap();
        fs::write(root.join("logs/run.log"), b"l").unwrap();
        fs::write(root.join("keep.txt"), b"k").unwrap();

        let config = WalkConfig::builder()
            .ignore_patterns(vec!["*.log".to_string()])
            .build()
            .unwrap();
        let expansion = walker(config).expand([&root]);
        let paths: Vec<_> = expansion.entries.iter().map(|e| e.path.clone()).collect();

        assert_eq!(
            paths,
            vec![PathBuf::from("root/keep.txt"), PathBuf::from("root/logs")]
        );
        assert!(expansion.entries[1].is_dir());
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let config = WalkConfig::builder()
            .ignore_patterns(vec!["[".to_string()])
            .build()
            .unwrap();
        assert!(FileWalker::new(Arc::new(LocalFs), config).is_err());
    }
}
