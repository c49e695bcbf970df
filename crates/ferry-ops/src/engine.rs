//! The operation state machine and its transfer loops.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use ferry_core::{
    Behavior, ConflictKind, EngineConfig, EngineError, EngineResult, FileEntry, Filesystem,
    LocalFs, Operation, OperationErrorRecord, OperationId, OperationKind, OperationStatus,
    PathSet, WriterId, normalize,
};
use ferry_walk::{FileWalker, WalkError, prune_empty_dirs};

use crate::events::{Event, EventBus, EventEnvelope, OperationEvents, OperationUpdate, Subscription};
use crate::executor::{ErrorClass, TransferError, TransferExecutor, TransferObserver};
use crate::ledger::{Ledger, Slot};
use crate::observed::ObservedFs;

struct Inner {
    fs: ObservedFs,
    ledger: Ledger,
    bus: EventBus,
    walker: FileWalker,
    executor: TransferExecutor,
    config: EngineConfig,
    tracker: TaskTracker,
    shutting_down: AtomicBool,
}

/// Runs copy and move operations.
///
/// Cheap to clone; clones share the same ledger and event bus. Methods that
/// start transfer loops must be called from within a tokio runtime.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

/// What the transfer loop does next, decided under the operation lock.
enum Step {
    Transfer(Job),
    Finalize(OperationStatus),
    Exit,
}

struct Job {
    index: usize,
    entry: FileEntry,
    kind: OperationKind,
    destination: PathBuf,
    token: CancellationToken,
    replace: Option<PathBuf>,
}

impl Job {
    fn target(&self) -> PathBuf {
        self.entry.target_in(&self.destination)
    }
}

/// A requested path the walker could not turn into entries.
struct Skipped {
    path: PathBuf,
    message: String,
}

/// The result of expanding requested roots.
struct Gathered {
    entries: Vec<FileEntry>,
    skipped: Vec<Skipped>,
}

impl Engine {
    /// Create an engine over `fs`.
    pub fn new(fs: Arc<dyn Filesystem>, config: EngineConfig) -> EngineResult<Self> {
        let bus = EventBus::new(config.event_capacity);
        let observed = ObservedFs::new(Arc::clone(&fs), bus.clone());
        let walker = FileWalker::new(fs, config.walk.clone()).map_err(|e| {
            EngineError::InvalidInput {
                message: e.to_string(),
            }
        })?;
        let executor = TransferExecutor::new(observed.clone(), &config);

        Ok(Self {
            inner: Arc::new(Inner {
                fs: observed,
                ledger: Ledger::new(),
                bus,
                walker,
                executor,
                config,
                tracker: TaskTracker::new(),
                shutting_down: AtomicBool::new(false),
            }),
        })
    }

    /// Create an engine over the local filesystem.
    pub fn local(config: EngineConfig) -> EngineResult<Self> {
        Self::new(Arc::new(LocalFs), config)
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// The observed filesystem, for standalone mutations that should be
    /// announced on the event bus.
    pub fn fs(&self) -> &ObservedFs {
        &self.inner.fs
    }

    /// Connect a writer. Operations must be created by a connected writer.
    pub fn connect(&self) -> Subscription {
        self.inner.bus.connect()
    }

    /// Subscribe to every event without registering a writer.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.inner.bus.subscribe()
    }

    /// Events of one operation, ending after its `OperationDone`.
    pub fn subscribe_operation(&self, id: OperationId) -> OperationEvents {
        OperationEvents::new(self.inner.bus.subscribe(), id)
    }

    /// Snapshot of one operation.
    pub fn get(&self, id: OperationId) -> EngineResult<Operation> {
        self.inner.ledger.get(id).ok_or(EngineError::NotFound { id })
    }

    /// Snapshots of every live operation, ordered by id.
    pub fn list(&self) -> Vec<Operation> {
        self.inner.ledger.list()
    }

    /// Create an operation in the `Default` status.
    ///
    /// Every root is expanded into concrete entries. A root that does not
    /// exist rejects the whole request. Paths below a root that cannot be
    /// expanded are recorded in `skipped` and announced as log lines.
    pub async fn create<I, P>(
        &self,
        owner: WriterId,
        kind: OperationKind,
        sources: I,
        destination: impl AsRef<Path>,
    ) -> EngineResult<OperationId>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        self.ensure_accepting()?;
        if !self.inner.bus.is_connected(owner) {
            return Err(EngineError::UnknownWriter { writer: owner });
        }

        let destination = absolute(destination.as_ref())?;
        let roots = roots_of(sources)?;
        if let Some(root) = roots.iter().find(|root| destination.starts_with(root)) {
            return Err(EngineError::InvalidInput {
                message: format!(
                    "cannot {kind} {} into itself ({})",
                    root.display(),
                    destination.display()
                ),
            });
        }

        let gathered = self.expand(roots).await?;
        let rate_limit = self.inner.config.default_rate_limit;
        let mut lines = Vec::new();
        let operation = self.inner.ledger.create(|id| {
            let mut op = Operation::new(id, owner, kind, destination);
            op.rate_limit = rate_limit;
            op.sources = dedupe(&[], gathered.entries);
            lines = record_skipped(&mut op, gathered.skipped);
            op
        });

        tracing::info!(
            target: "ferry::engine",
            id = %operation.id,
            %owner,
            %kind,
            sources = operation.sources.len(),
            skipped = operation.skipped.len(),
            "operation created"
        );
        let id = operation.id;
        let logs = lines.into_iter().map(|text| Event::OperationLog { id, text });
        self.inner.bus.publish_all(
            std::iter::once(Event::OperationCreated(Box::new(operation))).chain(logs),
        );
        Ok(id)
    }

    /// Expand `paths` and append the entries not already present.
    ///
    /// Returns the number of entries appended. Paths that cannot be expanded
    /// are recorded in `skipped`.
    pub async fn set_sources<I, P>(&self, id: OperationId, paths: I) -> EngineResult<usize>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let roots = roots_of(paths)?;
        self.ensure_live(id, "add sources to")?;
        let gathered = self.expand(roots).await?;

        let (added, skipped, lines) = self.modify(id, |slot| {
            let op = &mut slot.operation;
            if op.status.is_terminal() {
                return Err(EngineError::invalid_state(id, op.status, "add sources to"));
            }
            let added = dedupe(&op.sources, gathered.entries);
            op.sources.extend(added.iter().cloned());
            if !added.is_empty() {
                op.total_size = None;
            }
            let before = op.skipped.len();
            let lines = record_skipped(op, gathered.skipped);
            Ok((added, op.skipped[before..].to_vec(), lines))
        })?;

        let count = added.len();
        if count > 0 {
            tracing::debug!(target: "ferry::engine", %id, added = count, "sources appended");
        }
        let mut events = Vec::new();
        if count > 0 || !skipped.is_empty() {
            let mut update = OperationUpdate::new(id);
            update.sources_added = (!added.is_empty()).then_some(added);
            update.skipped_added = (!skipped.is_empty()).then_some(skipped);
            events.push(Event::OperationUpdated(update));
        }
        events.extend(lines.into_iter().map(|text| Event::OperationLog { id, text }));
        self.inner.bus.publish_all(events);
        Ok(count)
    }

    /// Move the cursor. Only allowed while paused.
    pub fn set_index(&self, id: OperationId, index: usize) -> EngineResult<()> {
        self.modify(id, |slot| {
            let op = &mut slot.operation;
            if op.status != OperationStatus::Paused {
                return Err(EngineError::invalid_state(id, op.status, "set the index of"));
            }
            if index > op.sources.len() {
                return Err(EngineError::IndexOutOfRange {
                    id,
                    index,
                    len: op.sources.len(),
                });
            }
            op.index = index;
            op.progress = 0;
            if op.error.as_ref().is_some_and(|error| error.index != index) {
                op.error = None;
            }
            slot.replace_pending = None;
            slot.auto_applied = None;
            Ok(())
        })?;

        self.inner
            .bus
            .publish(Event::OperationUpdated(OperationUpdate::new(id).index(index)));
        Ok(())
    }

    /// Change the destination directory. Only allowed before the first start.
    pub fn set_destination(
        &self,
        id: OperationId,
        destination: impl AsRef<Path>,
    ) -> EngineResult<()> {
        let destination = absolute(destination.as_ref())?;
        let changed = destination.clone();
        self.modify(id, move |slot| {
            let op = &mut slot.operation;
            if op.status != OperationStatus::Default {
                return Err(EngineError::invalid_state(id, op.status, "change the destination of"));
            }
            op.destination = destination;
            Ok(())
        })?;

        let mut update = OperationUpdate::new(id);
        update.destination = Some(changed);
        self.inner.bus.publish(Event::OperationUpdated(update));
        Ok(())
    }

    /// Choose how conflicts are resolved, optionally for every later
    /// conflict as well.
    pub fn set_behavior(
        &self,
        id: OperationId,
        behavior: Behavior,
        keep: bool,
    ) -> EngineResult<()> {
        self.modify(id, |slot| {
            let op = &mut slot.operation;
            if op.status.is_terminal() {
                return Err(EngineError::invalid_state(id, op.status, "change the behavior of"));
            }
            op.behavior = behavior;
            op.keep_behavior = keep;
            Ok(())
        })?;

        let mut update = OperationUpdate::new(id);
        update.behavior = Some(behavior);
        update.keep_behavior = Some(keep);
        self.inner.bus.publish(Event::OperationUpdated(update));
        Ok(())
    }

    /// Set the throughput limit in bytes per second, 0 for unlimited.
    ///
    /// Applies from the next chunk of the in-flight transfer.
    pub fn set_rate_limit(&self, id: OperationId, bytes_per_second: u64) -> EngineResult<()> {
        self.modify(id, |slot| {
            let op = &mut slot.operation;
            if op.status.is_terminal() {
                return Err(EngineError::invalid_state(id, op.status, "rate limit"));
            }
            op.rate_limit = bytes_per_second;
            Ok(())
        })?;

        let mut update = OperationUpdate::new(id);
        update.rate_limit = Some(bytes_per_second);
        self.inner.bus.publish(Event::OperationUpdated(update));
        Ok(())
    }

    /// Request a status change.
    pub fn set_status(&self, id: OperationId, status: OperationStatus) -> EngineResult<()> {
        match status {
            OperationStatus::Started => self.start(id),
            OperationStatus::Paused => self.pause(id),
            OperationStatus::Aborted => self.cancel(id),
            other => Err(EngineError::InvalidInput {
                message: format!("cannot request status {other}"),
            }),
        }
    }

    /// Start or resume transferring.
    pub fn start(&self, id: OperationId) -> EngineResult<()> {
        self.ensure_accepting()?;
        let spawn = self.modify(id, |slot| {
            let op = &mut slot.operation;
            match op.status {
                OperationStatus::Started => return Ok(None),
                OperationStatus::Default | OperationStatus::Paused => {}
                status => return Err(EngineError::invalid_state(id, status, "start")),
            }
            if op.error.is_some() {
                return Err(EngineError::UnresolvedConflict { id });
            }
            op.status = OperationStatus::Started;
            Ok(Some(slot.claim_runner()))
        })?;

        let Some(spawn) = spawn else {
            return Ok(());
        };
        tracing::info!(target: "ferry::engine", %id, "operation started");
        self.inner.bus.publish(Event::OperationUpdated(
            OperationUpdate::new(id).status(OperationStatus::Started),
        ));
        if spawn {
            self.spawn_loop(id);
        }
        Ok(())
    }

    /// Resume a paused operation.
    pub fn resume(&self, id: OperationId) -> EngineResult<()> {
        let status = self.get(id)?.status;
        if status != OperationStatus::Paused {
            return Err(EngineError::invalid_state(id, status, "resume"));
        }
        self.start(id)
    }

    /// Pause a running operation at its next chunk checkpoint.
    ///
    /// The partially written file is removed, and resuming transfers the
    /// same entry again from the beginning.
    pub fn pause(&self, id: OperationId) -> EngineResult<()> {
        self.modify(id, |slot| {
            let op = &mut slot.operation;
            if op.status != OperationStatus::Started {
                return Err(EngineError::invalid_state(id, op.status, "pause"));
            }
            op.status = OperationStatus::Paused;
            if let Some(token) = &slot.runner {
                token.cancel();
            }
            Ok(())
        })?;

        tracing::info!(target: "ferry::engine", %id, "operation paused");
        self.inner.bus.publish(Event::OperationUpdated(
            OperationUpdate::new(id).status(OperationStatus::Paused),
        ));
        Ok(())
    }

    /// Abort an operation.
    ///
    /// A partially written file is left in place.
    pub fn cancel(&self, id: OperationId) -> EngineResult<()> {
        let idle = self.modify(id, |slot| {
            let op = &mut slot.operation;
            if op.status.is_terminal() {
                return Err(EngineError::invalid_state(id, op.status, "cancel"));
            }
            op.status = OperationStatus::Aborted;
            op.error = None;
            match &slot.runner {
                Some(token) => {
                    token.cancel();
                    Ok(false)
                }
                None => Ok(true),
            }
        })?;

        tracing::info!(target: "ferry::engine", %id, "operation cancelled");
        self.inner.bus.publish(Event::OperationUpdated(
            OperationUpdate::new(id).status(OperationStatus::Aborted),
        ));
        // With no loop alive nobody else will finalize.
        if idle {
            self.retire(id, OperationStatus::Aborted);
        }
        Ok(())
    }

    /// Apply the chosen behavior to the pending error and resume.
    pub fn proceed(&self, id: OperationId) -> EngineResult<()> {
        self.ensure_accepting()?;
        let mut events = Vec::new();
        let spawn = self.modify(id, |slot| {
            let op = &mut slot.operation;
            if op.error.is_none() {
                return Err(EngineError::NothingToProceed { id });
            }
            if op.behavior == Behavior::Default {
                return Err(EngineError::NoResolution { id });
            }
            let Some(error) = op.error.take() else {
                return Err(EngineError::NothingToProceed { id });
            };
            let behavior = op.consume_behavior();
            slot.auto_applied = None;
            resolve(slot, behavior, &error, &mut events);
            slot.operation.status = OperationStatus::Started;
            Ok(slot.claim_runner())
        })?;

        events.push(Event::OperationUpdated(
            OperationUpdate::new(id).status(OperationStatus::Started),
        ));
        self.inner.bus.publish_all(events);
        if spawn {
            self.spawn_loop(id);
        }
        Ok(())
    }

    /// Total size of all sources, computed on first request and cached until
    /// sources change.
    pub fn size(&self, id: OperationId) -> EngineResult<u64> {
        let (total, computed) = self.modify(id, |slot| {
            let op = &mut slot.operation;
            Ok(match op.total_size {
                Some(total) => (total, false),
                None => {
                    let total = op.compute_total_size();
                    op.total_size = Some(total);
                    (total, true)
                }
            })
        })?;

        if computed {
            let mut update = OperationUpdate::new(id);
            update.total_size = Some(total);
            self.inner.bus.publish(Event::OperationUpdated(update));
        }
        Ok(total)
    }

    /// Create a directory and its parents.
    pub async fn mkdir(&self, path: impl AsRef<Path>) -> EngineResult<()> {
        let path = absolute(path.as_ref())?;
        self.blocking(move |inner| {
            inner
                .fs
                .mkdir(&path)
                .map_err(|source| EngineError::Io { path, source })
        })
        .await?
    }

    /// Remove a file or a directory tree.
    pub async fn remove(&self, path: impl AsRef<Path>) -> EngineResult<()> {
        let path = absolute(path.as_ref())?;
        self.blocking(move |inner| inner.fs.remove(&path).map_err(|e| EngineError::io(path, e)))
            .await?
    }

    /// Rename an entry in place.
    pub async fn rename(&self, from: impl AsRef<Path>, to: impl AsRef<Path>) -> EngineResult<()> {
        let from = absolute(from.as_ref())?;
        let to = absolute(to.as_ref())?;
        self.blocking(move |inner| {
            if inner.fs.exists(&to) {
                return Err(EngineError::InvalidInput {
                    message: format!("{} already exists", to.display()),
                });
            }
            inner.fs.rename(&from, &to).map_err(|e| EngineError::io(from, e))
        })
        .await?
    }

    /// Size of a path, recursive for directories.
    pub async fn size_of(&self, path: impl AsRef<Path>) -> EngineResult<u64> {
        let path = absolute(path.as_ref())?;
        self.blocking(move |inner| inner.fs.size_of(&path).map_err(|e| EngineError::io(path, e)))
            .await?
    }

    /// Abort every live operation and wait for their loops to finish.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        for id in self.inner.ledger.ids() {
            if let Err(err) = self.cancel(id) {
                tracing::debug!(target: "ferry::engine", %id, "not cancelled on shutdown: {}", err);
            }
        }
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        tracing::info!(target: "ferry::engine", "engine shut down");
    }

    fn ensure_accepting(&self) -> EngineResult<()> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            Err(EngineError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    fn ensure_live(&self, id: OperationId, action: &'static str) -> EngineResult<()> {
        let status = self
            .inner
            .ledger
            .read(id, |op| op.status)
            .ok_or(EngineError::NotFound { id })?;
        if status.is_terminal() {
            return Err(EngineError::invalid_state(id, status, action));
        }
        Ok(())
    }

    fn modify<R>(
        &self,
        id: OperationId,
        f: impl FnOnce(&mut Slot) -> EngineResult<R>,
    ) -> EngineResult<R> {
        self.inner.ledger.update_slot(id, f)?
    }

    async fn blocking<R, F>(&self, f: F) -> EngineResult<R>
    where
        F: FnOnce(&Inner) -> R + Send + 'static,
        R: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| EngineError::Task {
                message: e.to_string(),
            })
    }

    async fn expand(&self, roots: Vec<PathBuf>) -> EngineResult<Gathered> {
        self.blocking(move |inner| {
            for root in &roots {
                if let Err(e) = inner.fs.stat(root) {
                    return Err(EngineError::io(root.clone(), e));
                }
            }
            let expansion = inner.walker.expand(roots);
            let skipped = expansion
                .warnings
                .iter()
                .filter_map(skipped_from)
                .inspect(|skipped| {
                    tracing::warn!(
                        target: "ferry::engine",
                        path = %skipped.path.display(),
                        "{}",
                        skipped.message
                    );
                })
                .collect();
            Ok(Gathered {
                entries: expansion.entries,
                skipped,
            })
        })
        .await?
    }

    fn spawn_loop(&self, id: OperationId) {
        let engine = self.clone();
        self.inner.tracker.spawn(async move {
            engine.run(id).await;
        });
    }

    /// Publish the terminal event and drop the operation.
    fn retire(&self, id: OperationId, status: OperationStatus) {
        let skipped = self.inner.ledger.read(id, |op| op.skipped.len()).unwrap_or(0);
        self.inner.bus.publish(Event::OperationDone {
            id,
            status,
            skipped,
        });
        self.inner.ledger.delete(id);
        tracing::info!(target: "ferry::engine", %id, %status, "operation done");
    }

    async fn run(&self, id: OperationId) {
        let mut prepared = false;
        let mut attempts = 0u32;

        loop {
            let step = match self.next_step(id) {
                Ok(step) => step,
                Err(err) => {
                    tracing::debug!(target: "ferry::engine", %id, "transfer loop exits: {}", err);
                    return;
                }
            };

            let job = match step {
                Step::Transfer(job) => job,
                Step::Finalize(status) => {
                    self.finalize(id, status).await;
                    return;
                }
                Step::Exit => return,
            };

            if !prepared {
                if let Err(err) = self.prepare_destination(&job).await {
                    self.abort_with(id, &job, err.to_string());
                    continue;
                }
                prepared = true;
            }

            if let Some(path) = &job.replace {
                self.remove_for_replace(path).await;
            }

            let result = self.transfer(id, &job).await;
            match result {
                Ok(bytes) => {
                    attempts = 0;
                    self.complete(id, &job, bytes);
                }
                Err(err) => match err.class() {
                    ErrorClass::Interrupted => {
                        attempts = 0;
                        self.interrupted(id, &job, err.path()).await;
                    }
                    ErrorClass::Conflict(kind) => {
                        attempts = 0;
                        self.conflict(id, &job, &err, kind);
                    }
                    ErrorClass::Transient if attempts < self.inner.config.max_retries => {
                        attempts += 1;
                        tracing::warn!(
                            target: "ferry::engine",
                            %id,
                            attempt = attempts,
                            "transient failure, retrying: {}",
                            err
                        );
                        tokio::select! {
                            _ = job.token.cancelled() => {}
                            _ = tokio::time::sleep(self.inner.config.retry_delay()) => {}
                        }
                    }
                    ErrorClass::Transient | ErrorClass::Fatal => {
                        attempts = 0;
                        self.abort_with(id, &job, err.to_string());
                    }
                },
            }
        }
    }

    fn next_step(&self, id: OperationId) -> EngineResult<Step> {
        let mut finished = false;
        let step = self.inner.ledger.update_slot(id, |slot| {
            let op = &mut slot.operation;
            match op.status {
                OperationStatus::Aborted => {
                    slot.runner = None;
                    Step::Finalize(OperationStatus::Aborted)
                }
                OperationStatus::Started if op.is_exhausted() => {
                    op.status = OperationStatus::Finished;
                    op.progress = 0;
                    slot.runner = None;
                    finished = true;
                    Step::Finalize(OperationStatus::Finished)
                }
                OperationStatus::Started => {
                    let token = slot.runner.get_or_insert_with(CancellationToken::new).clone();
                    let entry = op.sources[op.index].clone();
                    Step::Transfer(Job {
                        index: op.index,
                        entry,
                        kind: op.kind,
                        destination: op.destination.clone(),
                        token,
                        replace: slot.replace_pending.take(),
                    })
                }
                _ => {
                    slot.runner = None;
                    Step::Exit
                }
            }
        })?;

        if finished {
            self.inner.bus.publish(Event::OperationUpdated(
                OperationUpdate::new(id).status(OperationStatus::Finished),
            ));
        }
        Ok(step)
    }

    async fn prepare_destination(&self, job: &Job) -> EngineResult<()> {
        let destination = job.destination.clone();
        self.blocking(move |inner| {
            if inner.fs.exists(&destination) {
                return Ok(());
            }
            inner
                .fs
                .mkdir(&destination)
                .map_err(|source| EngineError::Io {
                    path: destination,
                    source,
                })
        })
        .await?
    }

    async fn remove_for_replace(&self, path: &Path) {
        let path = path.to_path_buf();
        let result = self
            .blocking(move |inner| match inner.fs.remove(&path) {
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                other => other.map_err(|e| EngineError::io(path, e)),
            })
            .await;
        if let Err(err) = result.and_then(|r| r) {
            // The retry will conflict again and pause.
            tracing::warn!(
                target: "ferry::engine",
                "replace could not remove destination: {}",
                err
            );
        }
    }

    async fn transfer(&self, id: OperationId, job: &Job) -> Result<u64, TransferError> {
        let inner = Arc::clone(&self.inner);
        let index = job.index;
        let kind = job.kind;
        let entry = job.entry.clone();
        let destination = job.destination.clone();
        let token = job.token.clone();

        let result = tokio::task::spawn_blocking(move || {
            let mut observer = LedgerObserver {
                inner: Arc::clone(&inner),
                id,
                index,
            };
            inner
                .executor
                .transfer(kind, &entry, &destination, &token, &mut observer)
        })
        .await;

        match result {
            Ok(result) => result,
            Err(join) => Err(TransferError::DestinationUnwritable {
                path: job.target(),
                source: io::Error::other(join.to_string()),
            }),
        }
    }

    fn complete(&self, id: OperationId, job: &Job, bytes: u64) {
        let target = job.target();
        let verb = match job.kind {
            OperationKind::Copy => "Copied",
            OperationKind::Move => "Moved",
        };
        let line = format!(
            "{verb} {} -> {} ({bytes} bytes)",
            job.entry.absolute.display(),
            target.display()
        );

        let result = self.inner.ledger.update_slot(id, |slot| {
            let op = &mut slot.operation;
            if op.index != job.index {
                return None;
            }
            op.index += 1;
            op.progress = 0;
            slot.auto_applied = None;
            Some((op.index, op.append_log(line)))
        });

        if let Ok(Some((index, text))) = result {
            tracing::debug!(target: "ferry::engine", %id, "{}", text);
            self.inner.bus.publish_all([
                Event::OperationUpdated(OperationUpdate::new(id).index(index)),
                Event::OperationLog { id, text },
            ]);
        }
    }

    async fn interrupted(&self, id: OperationId, job: &Job, partial: Option<&Path>) {
        let status = self
            .inner
            .ledger
            .update(id, |op| {
                if op.index == job.index {
                    op.progress = 0;
                }
                op.status
            })
            .ok();

        // Aborted transfers keep their partial file.
        let Some(partial) = partial.filter(|_| status != Some(OperationStatus::Aborted)) else {
            return;
        };
        let partial = partial.to_path_buf();
        let result = self
            .blocking(move |inner| inner.executor.discard_partial(&partial))
            .await;
        if let Ok(Err(err)) = result {
            tracing::warn!(target: "ferry::engine", %id, "failed to discard partial file: {}", err);
        }
    }

    fn conflict(&self, id: OperationId, job: &Job, err: &TransferError, kind: ConflictKind) {
        let record = OperationErrorRecord {
            index: job.index,
            source: job.entry.clone(),
            destination: match (kind, err.path()) {
                (ConflictKind::DestinationExists, Some(path)) => path.to_path_buf(),
                _ => job.target(),
            },
            message: err.to_string(),
            kind,
        };

        let mut events = Vec::new();
        let result = self.inner.ledger.update_slot(id, |slot| {
            let op = &mut slot.operation;
            if op.index != job.index || op.status != OperationStatus::Started {
                // Paused or cancelled meanwhile; a resume meets the conflict again.
                return;
            }

            let behavior = op.behavior;
            let auto = op.keep_behavior
                && behavior != Behavior::Default
                && (behavior == Behavior::Skip || slot.auto_applied != Some(op.index));
            if auto {
                slot.auto_applied = Some(op.index);
                resolve(slot, behavior, &record, &mut events);
                return;
            }

            op.status = OperationStatus::Paused;
            op.progress = 0;
            op.error = Some(record.clone());
            events.push(Event::OperationUpdated(
                OperationUpdate::new(id).status(OperationStatus::Paused),
            ));
            events.push(Event::OperationError {
                id,
                error: record.clone(),
            });
        });

        if result.is_ok() {
            tracing::info!(target: "ferry::engine", %id, index = job.index, "conflict: {}", record);
            self.inner.bus.publish_all(events);
        }
    }

    fn abort_with(&self, id: OperationId, job: &Job, message: String) {
        let record = OperationErrorRecord {
            index: job.index,
            source: job.entry.clone(),
            destination: job.target(),
            message,
            kind: ConflictKind::Other,
        };

        let mut events = Vec::new();
        let result = self.inner.ledger.update_slot(id, |slot| {
            let op = &mut slot.operation;
            if op.status.is_terminal() {
                return;
            }
            op.status = OperationStatus::Aborted;
            op.error = None;
            let text = op.append_log(format!("Failed: {record}"));
            events.push(Event::OperationUpdated(
                OperationUpdate::new(id).status(OperationStatus::Aborted),
            ));
            events.push(Event::OperationError {
                id,
                error: record.clone(),
            });
            events.push(Event::OperationLog { id, text });
        });

        if result.is_ok() && !events.is_empty() {
            tracing::error!(target: "ferry::engine", %id, "operation aborted: {}", record);
            self.inner.bus.publish_all(events);
        }
    }

    async fn finalize(&self, id: OperationId, status: OperationStatus) {
        if status == OperationStatus::Finished {
            let line = self
                .inner
                .ledger
                .update(id, |op| {
                    (!op.is_complete()).then(|| {
                        op.append_log(format!(
                            "Finished, {} requested paths were not transferred",
                            op.skipped.len()
                        ))
                    })
                })
                .ok()
                .flatten();
            if let Some(text) = line {
                tracing::warn!(target: "ferry::engine", %id, "{}", text);
                self.inner.bus.publish(Event::OperationLog { id, text });
            }
        }
        if status == OperationStatus::Finished && self.inner.config.prune_moved_dirs {
            let roots = self
                .inner
                .ledger
                .read(id, |op| (op.kind == OperationKind::Move).then(|| moved_roots(&op.sources)))
                .flatten();
            if let Some(roots) = roots {
                let result = self
                    .blocking(move |inner| {
                        for root in roots.iter() {
                            if let Err(err) = prune_empty_dirs(&inner.fs, root) {
                                tracing::warn!(
                                    target: "ferry::engine",
                                    path = %root.display(),
                                    "failed to prune moved directory: {}",
                                    err
                                );
                            }
                        }
                    })
                    .await;
                if let Err(err) = result {
                    tracing::warn!(target: "ferry::engine", %id, "{}", err);
                }
            }
        }
        self.retire(id, status);
    }
}

/// Apply a conflict resolution to the slot, collecting the events to publish.
fn resolve(
    slot: &mut Slot,
    behavior: Behavior,
    error: &OperationErrorRecord,
    events: &mut Vec<Event>,
) {
    let op = &mut slot.operation;
    let id = op.id;
    op.progress = 0;
    let text = match behavior {
        Behavior::Skip => {
            if op.index == error.index && !op.is_exhausted() {
                op.index += 1;
                events.push(Event::OperationUpdated(OperationUpdate::new(id).index(op.index)));
            }
            op.append_log(format!("Skipped {}", error.source.absolute.display()))
        }
        Behavior::Replace => {
            slot.replace_pending = Some(error.destination.clone());
            op.append_log(format!("Replacing {}", error.destination.display()))
        }
        Behavior::Continue | Behavior::Default => {
            op.append_log(format!("Retrying {}", error.source.absolute.display()))
        }
    };
    events.push(Event::OperationLog { id, text });
}

/// Reports executor progress into the ledger and onto the bus.
struct LedgerObserver {
    inner: Arc<Inner>,
    id: OperationId,
    index: usize,
}

impl TransferObserver for LedgerObserver {
    fn rate_limit(&self) -> u64 {
        self.inner.ledger.read(self.id, |op| op.rate_limit).unwrap_or(0)
    }

    fn progress(&mut self, transferred: u64) {
        let index = self.index;
        let current = self.inner.ledger.update(self.id, |op| {
            if op.index == index {
                op.progress = transferred;
                true
            } else {
                false
            }
        });
        if matches!(current, Ok(true)) {
            self.inner.bus.publish(Event::OperationProgress {
                id: self.id,
                index,
                size: transferred,
            });
        }
    }
}

fn absolute(path: &Path) -> EngineResult<PathBuf> {
    if !path.is_absolute() {
        return Err(EngineError::InvalidInput {
            message: format!("path must be absolute: {}", path.display()),
        });
    }
    Ok(normalize(path))
}

fn roots_of<I, P>(paths: I) -> EngineResult<Vec<PathBuf>>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    let set: PathSet = paths.into_iter().collect();
    if let Some(relative) = set.iter().find(|p| !p.is_absolute()) {
        return Err(EngineError::InvalidInput {
            message: format!("path must be absolute: {}", relative.display()),
        });
    }
    Ok(set.into_vec())
}

fn skipped_from(warning: &WalkError) -> Option<Skipped> {
    let path = warning.path()?.to_path_buf();
    Some(Skipped {
        path,
        message: format!("Not added: {warning}"),
    })
}

/// Record newly skipped paths on `op`, returning the log lines to publish.
fn record_skipped(op: &mut Operation, skipped: Vec<Skipped>) -> Vec<String> {
    let mut lines = Vec::new();
    for skipped in skipped {
        if op.skipped.contains(&skipped.path) {
            continue;
        }
        op.skipped.push(skipped.path);
        lines.push(op.append_log(skipped.message));
    }
    lines
}

/// Entries of `incoming` whose absolute path is not in `existing` or earlier
/// in `incoming`.
fn dedupe(existing: &[FileEntry], incoming: Vec<FileEntry>) -> Vec<FileEntry> {
    let mut seen: PathSet = existing.iter().map(|e| &e.absolute).collect();
    incoming
        .into_iter()
        .filter(|entry| seen.insert(&entry.absolute))
        .collect()
}

/// The requested roots a move drew its entries from.
fn moved_roots(sources: &[FileEntry]) -> PathSet {
    sources
        .iter()
        .filter_map(|entry| {
            let depth = entry.path.components().count();
            entry.absolute.ancestors().nth(depth.saturating_sub(1))
        })
        .collect()
}
