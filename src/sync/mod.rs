//! Sync module
//!
//! Client side of the bidirectional sync protocol: the transport port and
//! wire shapes, the record codec, the sync cursor and event-map stores, the
//! pending-event version rewriter, and the background pull/push engine.

mod engine;
mod meta;
mod record;
mod rewriter;
mod server_stub;
mod transport;

pub use engine::{SyncEngine, SyncHandle};
pub use meta::{SyncEventMapStore, SyncMetaStore};
pub use record::{RemoteEvent, SyncEventRecord};
pub use rewriter::{PendingEventVersionRewriter, RewriteOutcome};
pub use server_stub::InMemorySyncServer;
pub use transport::{
    ConflictReason, PullRequest, PullResponse, PushAssignment, PushEvent, PushOutcome,
    PushRequest, RemoteEventRecord, SyncDirection, SyncTransport, TransportError,
};

use chrono::{DateTime, Utc};

use crate::event_store::EventStoreError;

/// Errors from the sync subsystem
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    EventStore(#[from] EventStoreError),

    #[error(transparent)]
    Crypto(#[from] crate::crypto::CryptoError),

    #[error(transparent)]
    Codec(#[from] crate::codec::CodecError),

    #[error("Record serialization error: {0}")]
    Record(#[from] serde_json::Error),
}

impl SyncError {
    /// Check if retrying the operation can help.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport(e) => e.is_retryable(),
            SyncError::Database(_) => true,
            _ => false,
        }
    }
}

/// What the engine is currently doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Syncing { direction: SyncDirection },
    Paused { reason: String },
    Error { code: &'static str, retry_at: Option<DateTime<Utc>> },
}

/// User-visible sync status published through a watch channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub state: SyncState,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl SyncStatus {
    pub fn initial() -> Self {
        Self {
            state: SyncState::Idle,
            last_success_at: None,
            last_error: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state == SyncState::Idle
    }
}
