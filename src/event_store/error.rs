//! Event Store Errors
//!
//! Error types for event store operations.

use crate::codec::CodecError;
use crate::crypto::CryptoError;

/// Errors that can occur in the event store
#[derive(Debug, thiserror::Error)]
pub enum EventStoreError {
    /// Optimistic concurrency conflict
    #[error("Concurrency conflict for {aggregate_type}/{aggregate_id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        aggregate_type: String,
        aggregate_id: String,
        expected: i64,
        actual: i64,
    },

    /// Idempotency key reused with different command metadata
    #[error("Idempotency key reused with different command: {key}")]
    IdempotencyReuse { key: String },

    /// The submitted batch violates its own constraints
    #[error("Invalid event batch: {0}")]
    InvalidBatch(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Crypto failure while encrypting or decrypting stream data
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Envelope encoding/decoding failure
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Any other storage failure while saving
    #[error("Persistence failure: {0}")]
    Persistence(String),
}

impl EventStoreError {
    /// Check if this error is a concurrency conflict
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, EventStoreError::ConcurrencyConflict { .. })
    }

    /// Wrap any non-conflict error as a persistence failure
    pub fn into_persistence(self) -> Self {
        match self {
            e @ EventStoreError::ConcurrencyConflict { .. } => e,
            e @ EventStoreError::IdempotencyReuse { .. } => e,
            e @ EventStoreError::Persistence(_) => e,
            other => EventStoreError::Persistence(other.to_string()),
        }
    }
}
