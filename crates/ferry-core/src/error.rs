//! Error types returned to callers of the engine.

use std::path::PathBuf;

use thiserror::Error;

use crate::operation::{OperationId, OperationStatus, WriterId};

/// Errors a caller can receive synchronously from an engine request.
///
/// Per-file transfer failures never surface here; they are recorded on the
/// operation itself and published as events.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No live operation has this id.
    #[error("Operation not found: {id}")]
    NotFound { id: OperationId },

    /// The requested transition is not valid from the current status.
    #[error("Cannot {action} {id} while it is {status}")]
    InvalidState {
        id: OperationId,
        status: OperationStatus,
        action: &'static str,
    },

    /// `set_index` past the end of the sources.
    #[error("Index {index} is out of range for {id} ({len} sources)")]
    IndexOutOfRange {
        id: OperationId,
        index: usize,
        len: usize,
    },

    /// `proceed` was called with no behavior chosen.
    #[error("No resolution chosen for {id}")]
    NoResolution { id: OperationId },

    /// `proceed` was called but nothing is blocking the operation.
    #[error("{id} has no pending error")]
    NothingToProceed { id: OperationId },

    /// `start` was called while an error awaits a decision.
    #[error("{id} is blocked on an unresolved error, proceed first")]
    UnresolvedConflict { id: OperationId },

    /// The writer id does not belong to a connected subscriber.
    #[error("Unknown writer: {writer}")]
    UnknownWriter { writer: WriterId },

    /// A requested root path does not exist.
    #[error("Source not found: {path}")]
    SourceNotFound { path: PathBuf },

    /// Malformed request.
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    /// A background task panicked or was cancelled.
    #[error("Background task failed: {message}")]
    Task { message: String },

    /// The engine is shutting down.
    #[error("Engine is shutting down")]
    ShuttingDown,

    /// Generic I/O error.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::NotFound => Self::SourceNotFound { path },
            _ => Self::Io { path, source },
        }
    }

    /// Create an invalid state error.
    pub fn invalid_state(id: OperationId, status: OperationStatus, action: &'static str) -> Self {
        Self::InvalidState { id, status, action }
    }
}

/// Result alias for engine requests.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_io() {
        let err = EngineError::io(
            "/missing",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(matches!(err, EngineError::SourceNotFound { .. }));

        let err = EngineError::io(
            "/locked",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(matches!(err, EngineError::Io { .. }));
    }

    #[test]
    fn test_invalid_state_message() {
        let err =
            EngineError::invalid_state(OperationId(2), OperationStatus::Started, "set index of");
        assert_eq!(err.to_string(), "Cannot set index of op-2 while it is started");
    }
}
