//! Event Store module
//!
//! Persistence layer for the encrypted local log: the appender with
//! per-aggregate optimistic concurrency, the snapshot store, the
//! idempotency store, and the per-aggregate-type repository.

mod appender;
mod error;
mod idempotency;
mod repository;
mod snapshot;

pub use appender::{EventAppender, NewEncryptedEvent, StoredEventRow};
pub use error::EventStoreError;
pub use idempotency::{IdempotencyOutcome, IdempotencyRecord, IdempotencyStore};
pub use repository::Repository;
pub use snapshot::{SnapshotRecord, SnapshotStore};
