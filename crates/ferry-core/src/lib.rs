//! Core types and traits for ferry.
//!
//! This crate provides the operation model shared by the walker and the
//! engine, the caller-facing error type, configuration, and the
//! [`Filesystem`] capability every transfer goes through.

mod config;
mod entry;
mod error;
mod fs;
mod operation;
mod path_set;

pub use config::{EngineConfig, EngineConfigBuilder, WalkConfig, WalkConfigBuilder};
pub use entry::{EntryKind, FileEntry};
pub use error::{EngineError, EngineResult};
pub use fs::{CopyControl, CopyError, Filesystem, LocalFs};
pub use operation::{
    Behavior, ConflictKind, Operation, OperationErrorRecord, OperationId, OperationKind,
    OperationStatus, WriterId,
};
pub use path_set::{PathSet, normalize};
