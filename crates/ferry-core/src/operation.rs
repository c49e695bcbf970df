//! Operation model: ids, statuses, conflict behaviors and the operation record.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::entry::FileEntry;

/// Unique identifier of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// Identifier handed to an event subscriber when it connects.
///
/// Operations are tagged with the writer that created them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WriterId(pub u64);

impl fmt::Display for WriterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "writer-{}", self.0)
    }
}

/// What an operation does with its sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum OperationKind {
    #[default]
    Copy,
    Move,
}

/// Lifecycle status of an operation.
///
/// Serialized as its numeric discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString)]
#[serde(into = "u8", try_from = "u8")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[repr(u8)]
pub enum OperationStatus {
    /// Created, not yet running.
    #[default]
    Default = 0,
    /// Actively transferring.
    Started = 1,
    /// Suspended by the user or by an unresolved conflict.
    Paused = 2,
    /// Every source was transferred.
    Finished = 3,
    /// Cancelled or failed fatally.
    Aborted = 4,
}

impl OperationStatus {
    /// Check if no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Aborted)
    }
}

impl From<OperationStatus> for u8 {
    fn from(status: OperationStatus) -> Self {
        status as u8
    }
}

impl TryFrom<u8> for OperationStatus {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Default),
            1 => Ok(Self::Started),
            2 => Ok(Self::Paused),
            3 => Ok(Self::Finished),
            4 => Ok(Self::Aborted),
            other => Err(format!("invalid operation status: {other}")),
        }
    }
}

/// How the current conflict should be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Behavior {
    /// No decision yet.
    #[default]
    Default,
    /// Leave the destination alone and move to the next source.
    Skip,
    /// Remove the destination entry and retry.
    Replace,
    /// Retry as-is, the caller resolved the issue externally.
    Continue,
}

/// The kind of recoverable per-file error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictKind {
    /// Something already exists at the destination path.
    DestinationExists,
    /// The source entry disappeared after it was resolved.
    SourceMissing,
    /// The source entry cannot be read.
    PermissionDenied,
    /// Any other user-resolvable issue.
    Other,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DestinationExists => write!(f, "Destination already exists"),
            Self::SourceMissing => write!(f, "Source no longer exists"),
            Self::PermissionDenied => write!(f, "Permission denied"),
            Self::Other => write!(f, "Transfer failed"),
        }
    }
}

/// The error an operation is currently blocked on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationErrorRecord {
    /// Index of the source that failed.
    pub index: usize,
    /// The source entry that failed.
    pub source: FileEntry,
    /// Where the source was going.
    pub destination: PathBuf,
    /// Human-readable message.
    pub message: String,
    /// Classification of the failure.
    pub kind: ConflictKind,
}

impl fmt::Display for OperationErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}: {}",
            self.source.absolute.display(),
            self.destination.display(),
            self.message
        )
    }
}

/// A bulk copy or move job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub owner: WriterId,
    pub kind: OperationKind,
    pub destination: PathBuf,
    pub sources: Vec<FileEntry>,
    /// Requested paths the walker could not turn into sources. An operation
    /// that finishes with skipped paths did not transfer everything.
    #[serde(default)]
    pub skipped: Vec<PathBuf>,
    pub index: usize,
    pub status: OperationStatus,
    /// Bytes transferred of the file at `index`.
    pub progress: u64,
    /// Cached sum of source sizes, filled by the size request.
    pub total_size: Option<u64>,
    /// Bytes per second, 0 means unlimited.
    pub rate_limit: u64,
    pub behavior: Behavior,
    pub keep_behavior: bool,
    pub error: Option<OperationErrorRecord>,
    pub log: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Operation {
    /// Create an operation in the `Default` state with no sources.
    pub fn new(
        id: OperationId,
        owner: WriterId,
        kind: OperationKind,
        destination: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id,
            owner,
            kind,
            destination: destination.into(),
            sources: Vec::new(),
            skipped: Vec::new(),
            index: 0,
            status: OperationStatus::Default,
            progress: 0,
            total_size: None,
            rate_limit: 0,
            behavior: Behavior::Default,
            keep_behavior: false,
            error: None,
            log: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Check if the cursor is past the last source.
    pub fn is_exhausted(&self) -> bool {
        self.index >= self.sources.len()
    }

    /// Check if everything requested made it into the sources.
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }

    /// Sum of all source sizes.
    pub fn compute_total_size(&self) -> u64 {
        self.sources.iter().map(|s| s.size).sum()
    }

    /// Append a line to the transcript, returning it for publication.
    pub fn append_log(&mut self, line: impl Into<String>) -> String {
        let line = line.into();
        self.log.push(line.clone());
        line
    }

    /// Reset the behavior after it was applied, unless it is kept.
    pub fn consume_behavior(&mut self) -> Behavior {
        let behavior = self.behavior;
        if !self.keep_behavior {
            self.behavior = Behavior::Default;
        }
        behavior
    }

    /// Check the structural invariants of the record.
    pub fn invariants_hold(&self) -> bool {
        let cursor_ok = self.index <= self.sources.len();
        let finished_ok = self.status != OperationStatus::Finished
            || (self.is_exhausted() && self.error.is_none());
        let error_ok = self.error.is_none() || self.status == OperationStatus::Paused;
        cursor_ok && finished_ok && error_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_status_serializes_as_number() {
        let json = serde_json::to_string(&OperationStatus::Paused).unwrap();
        assert_eq!(json, "2");
        let back: OperationStatus = serde_json::from_str("4").unwrap();
        assert_eq!(back, OperationStatus::Aborted);
        assert!(serde_json::from_str::<OperationStatus>("9").is_err());
    }

    #[test]
    fn test_behavior_parse() {
        assert_eq!(Behavior::from_str("Replace").unwrap(), Behavior::Replace);
        assert_eq!(Behavior::from_str("skip").unwrap(), Behavior::Skip);
        assert_eq!(Behavior::Continue.to_string(), "continue");
    }

    #[test]
    fn test_consume_behavior() {
        let mut op = Operation::new(OperationId(1), WriterId(1), OperationKind::Copy, "/b");
        op.behavior = Behavior::Skip;
        assert_eq!(op.consume_behavior(), Behavior::Skip);
        assert_eq!(op.behavior, Behavior::Default);

        op.behavior = Behavior::Replace;
        op.keep_behavior = true;
        assert_eq!(op.consume_behavior(), Behavior::Replace);
        assert_eq!(op.behavior, Behavior::Replace);
    }

    #[test]
    fn test_invariants() {
        let mut op = Operation::new(OperationId(1), WriterId(1), OperationKind::Copy, "/b");
        assert!(op.invariants_hold());

        op.status = OperationStatus::Finished;
        assert!(op.invariants_hold());

        op.index = 1;
        assert!(!op.invariants_hold());
    }

    #[test]
    fn test_display_ids() {
        assert_eq!(OperationId(7).to_string(), "op-7");
        assert_eq!(WriterId(3).to_string(), "writer-3");
    }
}
