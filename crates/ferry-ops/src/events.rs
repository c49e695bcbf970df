//! Typed events and the bus that fans them out to subscribers.

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, ready};

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::Stream;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use ferry_core::{
    Behavior, FileEntry, Operation, OperationErrorRecord, OperationId, OperationStatus, WriterId,
};

/// The fields of an operation that changed. Unchanged fields are `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationUpdate {
    pub id: OperationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<OperationStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<PathBuf>,
    /// Entries appended to the sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources_added: Option<Vec<FileEntry>>,
    /// Requested paths that could not be added.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped_added: Option<Vec<PathBuf>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub behavior: Option<Behavior>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_behavior: Option<bool>,
}

impl OperationUpdate {
    /// An update with no changed fields.
    pub fn new(id: OperationId) -> Self {
        Self {
            id,
            status: None,
            index: None,
            destination: None,
            sources_added: None,
            skipped_added: None,
            total_size: None,
            rate_limit: None,
            behavior: None,
            keep_behavior: None,
        }
    }

    /// Record a status change.
    pub fn status(mut self, status: OperationStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Record a cursor change.
    pub fn index(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }
}

/// Everything the engine announces.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    /// A new operation entered the ledger.
    OperationCreated(Box<Operation>),
    /// Some fields of an operation changed.
    OperationUpdated(OperationUpdate),
    /// Bytes transferred of the file at `index`.
    OperationProgress {
        id: OperationId,
        index: usize,
        size: u64,
    },
    /// A per-file error, either awaiting a decision or fatal.
    OperationError {
        id: OperationId,
        error: OperationErrorRecord,
    },
    /// A line appended to the operation transcript.
    OperationLog { id: OperationId, text: String },
    /// The operation reached a terminal status and leaves the ledger.
    ///
    /// `skipped` counts requested paths that were never part of the sources.
    OperationDone {
        id: OperationId,
        status: OperationStatus,
        #[serde(default)]
        skipped: usize,
    },
    DirectoryCreated { path: PathBuf },
    EntryRemoved { path: PathBuf },
    EntryMoved { old: PathBuf, new: PathBuf },
}

impl Event {
    /// The operation this event concerns, if any.
    pub fn operation_id(&self) -> Option<OperationId> {
        match self {
            Self::OperationCreated(op) => Some(op.id),
            Self::OperationUpdated(update) => Some(update.id),
            Self::OperationProgress { id, .. }
            | Self::OperationError { id, .. }
            | Self::OperationLog { id, .. }
            | Self::OperationDone { id, .. } => Some(*id),
            Self::DirectoryCreated { .. } | Self::EntryRemoved { .. } | Self::EntryMoved { .. } => {
                None
            }
        }
    }

    /// Check if this is the last event of an operation.
    pub fn is_done(&self) -> bool {
        matches!(self, Self::OperationDone { .. })
    }
}

/// An event stamped with its publication time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: Event,
}

struct BusInner {
    tx: broadcast::Sender<EventEnvelope>,
    writers: DashSet<WriterId>,
    next_writer: AtomicU64,
}

/// Fan-out of events to every current subscriber.
///
/// Delivery never blocks the publisher. A subscriber that falls more than
/// the configured capacity behind loses the oldest events and must
/// reconcile with a fresh listing. Nothing is replayed to late subscribers.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(BusInner {
                tx,
                writers: DashSet::new(),
                next_writer: AtomicU64::new(1),
            }),
        }
    }

    /// Publish one event.
    pub fn publish(&self, event: Event) {
        // Only fails when nobody listens.
        let _ = self.inner.tx.send(EventEnvelope {
            at: Utc::now(),
            event,
        });
    }

    /// Publish events in order.
    pub fn publish_all(&self, events: impl IntoIterator<Item = Event>) {
        for event in events {
            self.publish(event);
        }
    }

    /// Connect a writer: a subscriber whose id may create operations.
    pub fn connect(&self) -> Subscription {
        let id = WriterId(self.inner.next_writer.fetch_add(1, Ordering::Relaxed));
        self.inner.writers.insert(id);
        tracing::debug!(target: "ferry::events", writer = %id, "writer connected");
        Subscription {
            rx: self.inner.tx.subscribe(),
            guard: WriterGuard {
                id,
                bus: Arc::clone(&self.inner),
            },
        }
    }

    /// Subscribe without registering a writer.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.inner.tx.subscribe()
    }

    /// Check if `writer` belongs to a live subscription.
    pub fn is_connected(&self, writer: WriterId) -> bool {
        self.inner.writers.contains(&writer)
    }
}

struct WriterGuard {
    id: WriterId,
    bus: Arc<BusInner>,
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        self.bus.writers.remove(&self.id);
        tracing::debug!(target: "ferry::events", writer = %self.id, "writer disconnected");
    }
}

/// A connected writer's event feed. Dropping it disconnects the writer.
pub struct Subscription {
    rx: broadcast::Receiver<EventEnvelope>,
    guard: WriterGuard,
}

impl Subscription {
    /// The id assigned at connection time.
    pub fn id(&self) -> WriterId {
        self.guard.id
    }

    /// Receive the next event.
    ///
    /// Returns [`broadcast::error::RecvError::Lagged`] when events were
    /// dropped because this subscriber fell behind.
    pub async fn recv(&mut self) -> Result<EventEnvelope, broadcast::error::RecvError> {
        self.rx.recv().await
    }

    /// Convert into a [`Stream`] that keeps the writer connected.
    pub fn into_stream(self) -> EventStream {
        EventStream {
            inner: BroadcastStream::new(self.rx),
            _guard: self.guard,
        }
    }
}

/// Stream form of a [`Subscription`].
pub struct EventStream {
    inner: BroadcastStream<EventEnvelope>,
    _guard: WriterGuard,
}

impl Stream for EventStream {
    type Item = Result<EventEnvelope, BroadcastStreamRecvError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Events of one operation, ending after its `OperationDone`.
pub struct OperationEvents {
    inner: BroadcastStream<EventEnvelope>,
    id: OperationId,
    done: bool,
}

impl OperationEvents {
    pub(crate) fn new(rx: broadcast::Receiver<EventEnvelope>, id: OperationId) -> Self {
        Self {
            inner: BroadcastStream::new(rx),
            id,
            done: false,
        }
    }
}

impl Stream for OperationEvents {
    type Item = Result<EventEnvelope, BroadcastStreamRecvError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if self.done {
                return Poll::Ready(None);
            }
            match ready!(Pin::new(&mut self.inner).poll_next(cx)) {
                Some(Ok(envelope)) if envelope.event.operation_id() == Some(self.id) => {
                    self.done = envelope.event.is_done();
                    return Poll::Ready(Some(Ok(envelope)));
                }
                Some(Ok(_)) => continue,
                other => return Poll::Ready(other),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let bus = EventBus::new(16);
        let mut a = bus.connect();
        let mut b = bus.subscribe();

        bus.publish(Event::EntryRemoved {
            path: PathBuf::from("/x"),
        });

        assert!(matches!(a.recv().await.unwrap().event, Event::EntryRemoved { .. }));
        assert!(matches!(b.recv().await.unwrap().event, Event::EntryRemoved { .. }));
    }

    #[tokio::test]
    async fn test_writer_registration_follows_subscription() {
        let bus = EventBus::new(4);
        let sub = bus.connect();
        let id = sub.id();
        assert!(bus.is_connected(id));

        let stream = sub.into_stream();
        assert!(bus.is_connected(id));

        drop(stream);
        assert!(!bus.is_connected(id));
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags_without_blocking() {
        let bus = EventBus::new(2);
        let mut slow = bus.connect();

        for i in 0..5 {
            bus.publish(Event::OperationLog {
                id: OperationId(1),
                text: format!("line {i}"),
            });
        }

        assert!(matches!(
            slow.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
        let next = slow.recv().await.unwrap();
        assert!(matches!(next.event, Event::OperationLog { ref text, .. } if text == "line 3"));
    }

    #[tokio::test]
    async fn test_operation_events_filter_and_end() {
        use tokio_stream::StreamExt;

        let bus = EventBus::new(16);
        let mut events = OperationEvents::new(bus.subscribe(), OperationId(2));

        bus.publish(Event::OperationLog {
            id: OperationId(1),
            text: "other".into(),
        });
        bus.publish(Event::OperationLog {
            id: OperationId(2),
            text: "mine".into(),
        });
        bus.publish(Event::OperationDone {
            id: OperationId(2),
            status: OperationStatus::Finished,
            skipped: 0,
        });
        bus.publish(Event::OperationLog {
            id: OperationId(2),
            text: "after".into(),
        });

        let first = events.next().await.unwrap().unwrap();
        assert!(matches!(first.event, Event::OperationLog { ref text, .. } if text == "mine"));
        assert!(events.next().await.unwrap().unwrap().event.is_done());
        assert!(events.next().await.is_none());
    }

    #[test]
    fn test_update_serializes_only_changed_fields() {
        let update = OperationUpdate::new(OperationId(3))
            .status(OperationStatus::Paused)
            .index(2);
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["status"], 2);
        assert_eq!(json["index"], 2);
        assert!(json.get("destination").is_none());
    }

    #[test]
    fn test_operation_id_routing() {
        let event = Event::OperationProgress {
            id: OperationId(9),
            index: 0,
            size: 10,
        };
        assert_eq!(event.operation_id(), Some(OperationId(9)));
        assert_eq!(
            Event::DirectoryCreated {
                path: PathBuf::from("/d")
            }
            .operation_id(),
            None
        );
    }
}
