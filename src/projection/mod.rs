//! Projection module
//!
//! Derived state maintained from the event log: the per-aggregate-type
//! runtime with its durable cursor, the encrypted cache and index artifact
//! stores, and the per-domain projectors.

mod analytics;
mod cache;
mod cursor;
mod decode;
mod meta;
mod runner;
mod runtime;
mod search;
mod snapshot_projector;

pub use analytics::{AnalyticsProjector, AnalyticsState};
pub use decode::EventDecoder;
pub use cache::{
    IndexArtifactRecord, IndexArtifactStore, ProjectionCacheRecord, ProjectionCacheStore,
};
pub use cursor::EffectiveCursor;
pub use meta::{ProjectionMeta, ProjectionMetaStore};
pub use runner::ProjectionTaskRunner;
pub use runtime::{ProjectionEventRow, ProjectionProcessor, ProjectionRuntime};
pub use search::{IndexStatus, SearchDoc, SearchOptions, SearchProjector, SearchQuery};
pub use snapshot_projector::SnapshotProjector;

use crate::codec::CodecError;
use crate::crypto::CryptoError;

/// Errors from the projection subsystem
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Processor-specific failure
    #[error("Processor failure: {0}")]
    Processor(String),
}

/// Ordering a projection consumes events in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionOrdering {
    /// Local-only order: `commit_sequence` ascending
    CommitSequence,
    /// Global order first, pending events after, by commit sequence
    EffectiveTotalOrder,
}

impl ProjectionOrdering {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectionOrdering::CommitSequence => "commit_sequence",
            ProjectionOrdering::EffectiveTotalOrder => "effective_total_order",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "commit_sequence" => Some(ProjectionOrdering::CommitSequence),
            "effective_total_order" => Some(ProjectionOrdering::EffectiveTotalOrder),
            _ => None,
        }
    }
}

/// Lifecycle phase of a projection runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionPhase {
    Idle,
    CatchingUp,
    Rebuilding,
}

impl ProjectionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectionPhase::Idle => "idle",
            ProjectionPhase::CatchingUp => "catching_up",
            ProjectionPhase::Rebuilding => "rebuilding",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(ProjectionPhase::Idle),
            "catching_up" => Some(ProjectionPhase::CatchingUp),
            "rebuilding" => Some(ProjectionPhase::Rebuilding),
            _ => None,
        }
    }
}
