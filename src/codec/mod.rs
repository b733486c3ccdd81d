//! Codec module
//!
//! Canonical envelopes for event payloads and snapshots, the per-event-type
//! upcaster registry, and the AAD builders that bind ciphertexts to their
//! place in the store.

pub mod aad;
pub mod envelope;

pub use envelope::{PayloadEnvelope, SnapshotEnvelope, UpcasterRegistry};

/// Errors from envelope encoding/decoding
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No upcast path from the stored payload version to the latest
    #[error("No upcast path for {event_type} payload v{version} (latest is v{latest})")]
    UnknownPayloadVersion {
        event_type: String,
        version: u32,
        latest: u32,
    },

    #[error("Unsupported snapshot schema v{version} (latest is v{latest})")]
    UnknownSnapshotVersion { version: u32, latest: u32 },
}
