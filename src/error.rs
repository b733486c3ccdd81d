//! Error handling module
//!
//! Crate-wide error aggregation over the per-subsystem error enums.

use crate::codec::CodecError;
use crate::config::ConfigError;
use crate::crypto::CryptoError;
use crate::event_store::EventStoreError;
use crate::projection::ProjectionError;
use crate::sync::{SyncError, TransportError};

/// Application-wide Result type
pub type AppResult<T> = Result<T, AppError>;

/// A single field-level validation failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldReason {
    pub field: &'static str,
    pub reason: String,
}

/// Application error types
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Command or DTO constraints violated; carries field-level reasons
    #[error("Validation failed: {}", format_reasons(.0))]
    Validation(Vec<FieldReason>),

    #[error(transparent)]
    EventStore(#[from] EventStoreError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Projection(#[from] ProjectionError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn format_reasons(reasons: &[FieldReason]) -> String {
    reasons
        .iter()
        .map(|r| format!("{}: {}", r.field, r.reason))
        .collect::<Vec<_>>()
        .join(", ")
}

impl AppError {
    /// Build a single-field validation error
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        AppError::Validation(vec![FieldReason {
            field,
            reason: reason.into(),
        }])
    }

    /// Check if this error signals a stale `known_version` (reload and retry)
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(
            self,
            AppError::EventStore(EventStoreError::ConcurrencyConflict { .. })
        )
    }

    /// Check if this error signals idempotency-key reuse with different metadata
    pub fn is_idempotency_reuse(&self) -> bool {
        matches!(
            self,
            AppError::EventStore(EventStoreError::IdempotencyReuse { .. })
        )
    }
}
