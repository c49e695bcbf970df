//! Operation engine for ferry.
//!
//! This crate runs long-lived copy and move operations that can be paused,
//! resumed, cancelled and rate limited while they run, with per-file
//! conflict resolution and every change announced on an event bus.

mod engine;
mod events;
mod executor;
mod ledger;
mod observed;
mod throttle;

pub use engine::Engine;
pub use events::{
    Event, EventBus, EventEnvelope, EventStream, OperationEvents, OperationUpdate, Subscription,
};
pub use executor::{ErrorClass, TransferError, TransferExecutor, TransferObserver};
pub use ledger::Ledger;
pub use observed::ObservedFs;
pub use throttle::{Pacer, chunk_size_for};
