//! The set of live operations.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use ferry_core::{EngineError, EngineResult, Operation, OperationId};

/// Ledger entry: the operation plus the bookkeeping of its transfer loop.
#[derive(Debug)]
pub(crate) struct Slot {
    pub(crate) operation: Operation,
    /// Present while a transfer loop is alive for this operation. Cancelling
    /// it interrupts the in-flight transfer at its next checkpoint.
    pub(crate) runner: Option<CancellationToken>,
    /// Destination entry to remove before the next transfer attempt.
    pub(crate) replace_pending: Option<PathBuf>,
    /// Index at which a kept `Replace`/`Continue` was last applied
    /// automatically, so a repeated conflict there pauses instead of looping.
    pub(crate) auto_applied: Option<usize>,
}

impl Slot {
    /// Make sure a transfer loop will observe the current status.
    ///
    /// Returns `true` when no loop is alive and the caller must spawn one.
    /// A live loop whose token was cancelled by a pause gets a fresh token
    /// and carries on.
    pub(crate) fn claim_runner(&mut self) -> bool {
        match &self.runner {
            Some(token) if !token.is_cancelled() => false,
            Some(_) => {
                self.runner = Some(CancellationToken::new());
                false
            }
            None => {
                self.runner = Some(CancellationToken::new());
                true
            }
        }
    }
}

/// Concurrent map of live operations keyed by id.
///
/// [`Ledger::update`] is the only way to mutate an operation. Mutators for
/// the same id never run concurrently; mutators for different ids may.
#[derive(Debug)]
pub struct Ledger {
    slots: DashMap<OperationId, Slot>,
    next_id: AtomicU64,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl Ledger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate an id and insert the operation built for it.
    pub fn create(&self, build: impl FnOnce(OperationId) -> Operation) -> Operation {
        let id = OperationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let operation = build(id);
        debug_assert_eq!(operation.id, id);
        let snapshot = operation.clone();
        self.slots.insert(
            id,
            Slot {
                operation,
                runner: None,
                replace_pending: None,
                auto_applied: None,
            },
        );
        snapshot
    }

    /// Snapshot of one operation.
    pub fn get(&self, id: OperationId) -> Option<Operation> {
        self.slots.get(&id).map(|slot| slot.operation.clone())
    }

    /// Read a projection of one operation without cloning it.
    pub fn read<R>(&self, id: OperationId, f: impl FnOnce(&Operation) -> R) -> Option<R> {
        self.slots.get(&id).map(|slot| f(&slot.operation))
    }

    /// Snapshots of every live operation, ordered by id.
    ///
    /// Each snapshot is consistent on its own; no atomicity across
    /// operations is implied.
    pub fn list(&self) -> Vec<Operation> {
        let mut operations: Vec<_> = self
            .slots
            .iter()
            .map(|slot| slot.operation.clone())
            .collect();
        operations.sort_by_key(|op| op.id);
        operations
    }

    /// Atomically read-modify-write one operation.
    pub fn update<R>(
        &self,
        id: OperationId,
        f: impl FnOnce(&mut Operation) -> R,
    ) -> EngineResult<R> {
        self.update_slot(id, |slot| f(&mut slot.operation))
    }

    pub(crate) fn update_slot<R>(
        &self,
        id: OperationId,
        f: impl FnOnce(&mut Slot) -> R,
    ) -> EngineResult<R> {
        let mut slot = self.slots.get_mut(&id).ok_or(EngineError::NotFound { id })?;
        let result = f(&mut slot);
        debug_assert!(
            slot.operation.invariants_hold(),
            "operation invariants violated: {:?}",
            slot.operation.id
        );
        Ok(result)
    }

    /// Remove an operation, returning its final state.
    pub fn delete(&self, id: OperationId) -> Option<Operation> {
        self.slots.remove(&id).map(|(_, slot)| slot.operation)
    }

    /// Ids of every live operation.
    pub fn ids(&self) -> Vec<OperationId> {
        self.slots.iter().map(|slot| *slot.key()).collect()
    }

    /// Number of live operations.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Check if no operation is live.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
