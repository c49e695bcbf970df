//! Per-entry transfers with pacing, progress and cancellation.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use ferry_core::{
    ConflictKind, CopyControl, CopyError, EngineConfig, FileEntry, Filesystem, OperationKind,
};

use crate::observed::ObservedFs;
use crate::throttle::{Pacer, chunk_size_for, sleep_unless_cancelled};

/// Receives the progress of one transfer and supplies its current rate limit.
pub trait TransferObserver: Send {
    /// Current limit in bytes per second, 0 for unlimited. Read every chunk.
    fn rate_limit(&self) -> u64;

    /// Bytes of the current entry transferred so far.
    fn progress(&mut self, transferred: u64);
}

/// Why a single transfer did not complete.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Something already occupies the destination path.
    #[error("Destination already exists: {}", path.display())]
    DestinationExists { path: PathBuf },

    /// The source vanished after it was resolved.
    #[error("Source no longer exists: {}", path.display())]
    SourceMissing { path: PathBuf },

    /// The source could not be read.
    #[error("Cannot read {}: {source}", path.display())]
    SourceUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The destination (or one of its parents) could not be written.
    #[error("Cannot write {}: {source}", path.display())]
    DestinationUnwritable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A move copied the data but could not delete the source.
    #[error("Copied but cannot remove source {}: {source}", path.display())]
    SourceNotRemoved {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Stopped at a checkpoint because the operation was paused or cancelled.
    /// `partial` is the destination file this attempt left half written.
    #[error("Transfer interrupted")]
    Interrupted { partial: Option<PathBuf> },
}

/// How the state machine reacts to a [`TransferError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Pause and wait for a decision.
    Conflict(ConflictKind),
    /// Retry the same entry a bounded number of times.
    Transient,
    /// Abort the whole operation.
    Fatal,
    /// Not an error; the operation changed status.
    Interrupted,
}

impl TransferError {
    /// Classify the error.
    pub fn class(&self) -> ErrorClass {
        use io::ErrorKind;

        match self {
            Self::DestinationExists { .. } => ErrorClass::Conflict(ConflictKind::DestinationExists),
            Self::SourceMissing { .. } => ErrorClass::Conflict(ConflictKind::SourceMissing),
            Self::SourceUnreadable { source, .. } => match source.kind() {
                ErrorKind::PermissionDenied => ErrorClass::Conflict(ConflictKind::PermissionDenied),
                ErrorKind::NotFound => ErrorClass::Conflict(ConflictKind::SourceMissing),
                _ => ErrorClass::Transient,
            },
            Self::DestinationUnwritable { source, .. } => match source.kind() {
                ErrorKind::AlreadyExists => ErrorClass::Conflict(ConflictKind::DestinationExists),
                ErrorKind::PermissionDenied
                | ErrorKind::ReadOnlyFilesystem
                | ErrorKind::StorageFull
                | ErrorKind::NotFound => ErrorClass::Fatal,
                _ => ErrorClass::Transient,
            },
            Self::SourceNotRemoved { .. } => ErrorClass::Fatal,
            Self::Interrupted { .. } => ErrorClass::Interrupted,
        }
    }

    /// The path the error is about. For conflicts on the destination side
    /// this is the entry a `Replace` removes.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::DestinationExists { path }
            | Self::SourceMissing { path }
            | Self::SourceUnreadable { path, .. }
            | Self::DestinationUnwritable { path, .. }
            | Self::SourceNotRemoved { path, .. } => Some(path),
            Self::Interrupted { partial } => partial.as_deref(),
        }
    }
}

/// Transfers one source entry at a time through the filesystem capability.
pub struct TransferExecutor {
    fs: ObservedFs,
    chunk_size: usize,
    progress_interval: Duration,
}

impl TransferExecutor {
    /// Create an executor using the chunking and progress settings of `config`.
    pub fn new(fs: ObservedFs, config: &EngineConfig) -> Self {
        Self {
            fs,
            chunk_size: config.chunk_size,
            progress_interval: config.progress_interval(),
        }
    }

    /// Copy or move `entry` into `destination`. Blocking.
    ///
    /// Returns the number of bytes transferred. `token` is checked after every
    /// chunk and during pacing sleeps.
    pub fn transfer(
        &self,
        kind: OperationKind,
        entry: &FileEntry,
        destination: &Path,
        token: &CancellationToken,
        observer: &mut dyn TransferObserver,
    ) -> Result<u64, TransferError> {
        if token.is_cancelled() {
            return Err(TransferError::Interrupted { partial: None });
        }
        let target = entry.target_in(destination);

        self.ensure_parent(&target)?;

        if entry.is_dir() {
            return self.make_dir(&target);
        }

        if self.fs.exists(&target) {
            return Err(TransferError::DestinationExists { path: target });
        }
        match self.fs.stat(&entry.absolute) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(TransferError::SourceMissing {
                    path: entry.absolute.clone(),
                });
            }
            Err(source) => {
                return Err(TransferError::SourceUnreadable {
                    path: entry.absolute.clone(),
                    source,
                });
            }
        }

        observer.progress(0);
        match kind {
            OperationKind::Copy => self.copy_file(entry, &target, token, observer),
            OperationKind::Move => self.move_file(entry, &target, token, observer),
        }
    }

    /// Remove the partial destination left by an interrupted transfer.
    pub fn discard_partial(&self, path: &Path) -> io::Result<()> {
        match self.fs.remove(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn ensure_parent(&self, target: &Path) -> Result<(), TransferError> {
        let Some(parent) = target.parent() else {
            return Ok(());
        };
        if self.fs.exists(parent) {
            return Ok(());
        }
        self.fs
            .mkdir(parent)
            .map_err(|source| TransferError::DestinationUnwritable {
                path: parent.to_path_buf(),
                source,
            })
    }

    fn make_dir(&self, target: &Path) -> Result<u64, TransferError> {
        match self.fs.stat(target) {
            Ok(existing) if existing.is_dir() => Ok(0),
            Ok(_) => Err(TransferError::DestinationExists {
                path: target.to_path_buf(),
            }),
            Err(_) => {
                self.fs
                    .mkdir(target)
                    .map_err(|source| TransferError::DestinationUnwritable {
                        path: target.to_path_buf(),
                        source,
                    })?;
                Ok(0)
            }
        }
    }

    fn copy_file(
        &self,
        entry: &FileEntry,
        target: &Path,
        token: &CancellationToken,
        observer: &mut dyn TransferObserver,
    ) -> Result<u64, TransferError> {
        let mut control = ChunkControl {
            token,
            pacer: Pacer::with_rate(observer.rate_limit()),
            observer: &mut *observer,
            chunk_size: self.chunk_size,
            interval: self.progress_interval,
            last_emit: Instant::now(),
            last_sent: 0,
        };

        let result = self.fs.copy(&entry.absolute, target, &mut control);
        let last_sent = control.last_sent;

        match result {
            Ok(copied) => {
                if copied != last_sent || copied == 0 {
                    observer.progress(copied);
                }
                Ok(copied)
            }
            Err(CopyError::Stopped(_)) => Err(TransferError::Interrupted {
                partial: Some(target.to_path_buf()),
            }),
            Err(CopyError::Destination(e)) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(TransferError::DestinationExists {
                    path: target.to_path_buf(),
                })
            }
            Err(err) => {
                // The target did not exist before this attempt, anything there now is ours.
                if let Err(e) = self.discard_partial(target) {
                    tracing::warn!(
                        target: "ferry::transfer",
                        path = %target.display(),
                        "failed to discard partial file: {}",
                        e
                    );
                }
                Err(match err {
                    CopyError::Source(e) if e.kind() == io::ErrorKind::NotFound => {
                        TransferError::SourceMissing {
                            path: entry.absolute.clone(),
                        }
                    }
                    CopyError::Source(source) => TransferError::SourceUnreadable {
                        path: entry.absolute.clone(),
                        source,
                    },
                    CopyError::Destination(source) | CopyError::Stopped(source) => {
                        TransferError::DestinationUnwritable {
                            path: target.to_path_buf(),
                            source,
                        }
                    }
                })
            }
        }
    }

    fn move_file(
        &self,
        entry: &FileEntry,
        target: &Path,
        token: &CancellationToken,
        observer: &mut dyn TransferObserver,
    ) -> Result<u64, TransferError> {
        // Try rename first (fast path for same filesystem)
        match self.fs.rename(&entry.absolute, target) {
            Ok(()) => {
                observer.progress(entry.size);
                return Ok(entry.size);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound && !self.fs.exists(&entry.absolute) => {
                return Err(TransferError::SourceMissing {
                    path: entry.absolute.clone(),
                });
            }
            Err(e) => {
                tracing::debug!(
                    target: "ferry::transfer",
                    "rename failed ({}), copying instead",
                    e
                );
            }
        }

        // Fall back to copy + delete for cross-filesystem moves
        let copied = self.copy_file(entry, target, token, observer)?;
        self.fs
            .remove(&entry.absolute)
            .map_err(|source| TransferError::SourceNotRemoved {
                path: entry.absolute.clone(),
                source,
            })?;
        Ok(copied)
    }
}

struct ChunkControl<'a> {
    token: &'a CancellationToken,
    observer: &'a mut dyn TransferObserver,
    pacer: Pacer,
    chunk_size: usize,
    interval: Duration,
    last_emit: Instant,
    last_sent: u64,
}

impl CopyControl for ChunkControl<'_> {
    fn chunk_size(&self) -> usize {
        chunk_size_for(self.observer.rate_limit(), self.chunk_size)
    }

    fn on_chunk(&mut self, copied: u64) -> io::Result<()> {
        let stopped = || io::Error::new(io::ErrorKind::Interrupted, "transfer interrupted");
        if self.token.is_cancelled() {
            return Err(stopped());
        }

        let delay = self.pacer.delay(copied, self.observer.rate_limit());
        if !delay.is_zero() && !sleep_unless_cancelled(delay, self.token) {
            return Err(stopped());
        }

        if self.last_emit.elapsed() >= self.interval {
            self.observer.progress(copied);
            self.last_emit = Instant::now();
            self.last_sent = copied;
        }
        Ok(())
    }
}
