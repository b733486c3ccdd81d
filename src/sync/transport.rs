//! Sync transport port
//!
//! Wire shapes for `sync/pull` and `sync/push` and the client-side port
//! the engine drives. Implementations own the HTTP (or in-process) edge.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Direction of a sync operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    Pull,
    Push,
}

impl std::fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncDirection::Pull => write!(f, "pull"),
            SyncDirection::Push => write!(f, "push"),
        }
    }
}

/// `GET sync/pull` query.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    pub store_id: String,
    pub since: i64,
    pub limit: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_ms: Option<u64>,
}

/// One event in a pull response or a conflict's `missing` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEventRecord {
    pub global_sequence: i64,
    pub event_id: String,
    pub record_json: String,
}

/// `sync/pull` response.
///
/// `head` is the server's max assigned global sequence at response time.
/// When `has_more` is true, `next_since` must be non-null.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    pub head: i64,
    pub events: Vec<RemoteEventRecord>,
    pub has_more: bool,
    pub next_since: Option<i64>,
}

/// One event submitted in a push.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushEvent {
    pub event_id: String,
    pub record_json: String,
}

/// `POST sync/push` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub store_id: String,
    pub expected_head: i64,
    pub events: Vec<PushEvent>,
}

/// Global sequence assigned to one pushed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushAssignment {
    pub event_id: String,
    pub global_sequence: i64,
}

/// Why a push was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    ServerAhead,
    ServerBehind,
}

/// Result of a push.
#[derive(Debug, Clone)]
pub enum PushOutcome {
    /// Strictly increasing assignments in submitted order
    Ok {
        head: i64,
        assigned: Vec<PushAssignment>,
    },

    /// The client must catch up; `missing` carries the remote events the
    /// client has not pulled yet (may be empty for `server_behind`)
    Conflict {
        head: i64,
        reason: ConflictReason,
        missing: Vec<RemoteEventRecord>,
    },
}

/// Errors surfaced by a transport implementation
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Connection-level failure; retried with backoff
    #[error("Network failure: {0}")]
    Network(String),

    /// The server answered with an error status
    #[error("Server failure: {0}")]
    Server(String),

    /// The server returned an impossible state; never retried silently
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// The in-flight request was aborted
    #[error("Request aborted")]
    Aborted,
}

impl TransportError {
    /// Check if retrying can help: network and server failures may clear
    /// up; protocol violations and aborts never do.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Network(_) | TransportError::Server(_))
    }
}

/// Client transport for the sync protocol.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn pull(&self, request: PullRequest) -> Result<PullResponse, TransportError>;

    async fn push(&self, request: PushRequest) -> Result<PushOutcome, TransportError>;

    /// Cheap reachability probe.
    async fn ping(&self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Install an abort signal for one direction. Default: unsupported.
    fn set_abort_signal(&self, _direction: SyncDirection, _signal: CancellationToken) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(TransportError::Network("connection reset".into()).is_retryable());
        assert!(TransportError::Server("500".into()).is_retryable());
        assert!(!TransportError::Protocol("bad nextSince".into()).is_retryable());
        assert!(!TransportError::Aborted.is_retryable());
    }

    #[test]
    fn test_conflict_reason_wire_names() {
        assert_eq!(
            serde_json::to_string(&ConflictReason::ServerAhead).unwrap(),
            r#""server_ahead""#
        );
        assert_eq!(
            serde_json::to_string(&ConflictReason::ServerBehind).unwrap(),
            r#""server_behind""#
        );
    }

    #[test]
    fn test_pull_response_wire_shape() {
        let response = PullResponse {
            head: 7,
            events: vec![RemoteEventRecord {
                global_sequence: 7,
                event_id: "e7".to_string(),
                record_json: "{}".to_string(),
            }],
            has_more: false,
            next_since: None,
        };

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["head"], 7);
        assert_eq!(json["events"][0]["globalSequence"], 7);
        assert_eq!(json["hasMore"], false);
        assert!(json["nextSince"].is_null());
    }
}
