//! In-memory sync server stub
//!
//! Implements the `sync/pull` / `sync/push` wire contract exactly: a global
//! append-only log with server-assigned sequences, head reporting, and
//! `server_ahead` / `server_behind` conflicts carrying missing events.
//! Shared between clients via `Arc` in tests and demos.

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::record;
use super::transport::{
    ConflictReason, PullRequest, PullResponse, PushOutcome, PushRequest, RemoteEventRecord,
    SyncTransport, TransportError,
};

#[derive(Debug, Default)]
struct ServerState {
    /// Accepted events in global order; `global_sequence` is index + 1
    log: Vec<RemoteEventRecord>,
}

impl ServerState {
    fn head(&self) -> i64 {
        self.log.len() as i64
    }

    fn events_after(&self, since: i64) -> impl Iterator<Item = &RemoteEventRecord> {
        self.log
            .iter()
            .filter(move |record| record.global_sequence > since)
    }
}

/// Shared in-memory server.
#[derive(Debug, Default)]
pub struct InMemorySyncServer {
    state: Mutex<ServerState>,
}

impl InMemorySyncServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current head, for assertions.
    pub async fn head(&self) -> i64 {
        self.state.lock().await.head()
    }

    /// Number of accepted events, for assertions.
    pub async fn event_count(&self) -> usize {
        self.state.lock().await.log.len()
    }
}

#[async_trait]
impl SyncTransport for InMemorySyncServer {
    async fn pull(&self, request: PullRequest) -> Result<PullResponse, TransportError> {
        let state = self.state.lock().await;

        let mut events: Vec<RemoteEventRecord> =
            state.events_after(request.since).cloned().collect();
        let total = events.len();
        events.truncate(request.limit.max(0) as usize);

        let has_more = total > events.len();
        let next_since = events.last().map(|record| record.global_sequence);

        Ok(PullResponse {
            head: state.head(),
            events,
            has_more,
            next_since,
        })
    }

    async fn push(&self, request: PushRequest) -> Result<PushOutcome, TransportError> {
        let mut state = self.state.lock().await;
        let head = state.head();

        if request.expected_head < head {
            return Ok(PushOutcome::Conflict {
                head,
                reason: ConflictReason::ServerAhead,
                missing: state.events_after(request.expected_head).cloned().collect(),
            });
        }
        if request.expected_head > head {
            return Ok(PushOutcome::Conflict {
                head,
                reason: ConflictReason::ServerBehind,
                missing: Vec::new(),
            });
        }

        let mut assigned = Vec::with_capacity(request.events.len());
        for event in &request.events {
            // The server refuses envelopes whose record disagrees.
            record::dematerialize(&event.event_id, &event.record_json)?;

            if let Some(existing) = state
                .log
                .iter()
                .find(|record| record.event_id == event.event_id)
            {
                assigned.push(super::transport::PushAssignment {
                    event_id: event.event_id.clone(),
                    global_sequence: existing.global_sequence,
                });
                continue;
            }

            let global_sequence = state.head() + 1;
            state.log.push(RemoteEventRecord {
                global_sequence,
                event_id: event.event_id.clone(),
                record_json: event.record_json.clone(),
            });
            assigned.push(super::transport::PushAssignment {
                event_id: event.event_id.clone(),
                global_sequence,
            });
        }

        Ok(PushOutcome::Ok {
            head: state.head(),
            assigned,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::StoredEventRow;
    use crate::sync::SyncEventRecord;

    fn push_event(id: &str, version: i64) -> super::super::transport::PushEvent {
        let row = StoredEventRow {
            commit_sequence: 0,
            id: id.to_string(),
            aggregate_type: "goal".to_string(),
            aggregate_id: "goal-A".to_string(),
            event_type: "GoalRenamed".to_string(),
            payload_encrypted: vec![1, 2, 3, 4],
            keyring_update: None,
            version,
            occurred_at: 0,
            actor_id: None,
            causation_id: None,
            correlation_id: None,
            epoch: None,
        };
        super::super::transport::PushEvent {
            event_id: id.to_string(),
            record_json: SyncEventRecord::from_row(&row).to_record_json().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_push_assigns_increasing_sequences() {
        let server = InMemorySyncServer::new();

        let outcome = server
            .push(PushRequest {
                store_id: "a".to_string(),
                expected_head: 0,
                events: vec![push_event("e1", 1), push_event("e2", 2)],
            })
            .await
            .unwrap();

        match outcome {
            PushOutcome::Ok { head, assigned } => {
                assert_eq!(head, 2);
                let sequences: Vec<i64> =
                    assigned.iter().map(|a| a.global_sequence).collect();
                assert_eq!(sequences, vec![1, 2]);
            }
            _ => panic!("expected ok"),
        }
    }

    #[tokio::test]
    async fn test_stale_head_conflicts_with_missing() {
        let server = InMemorySyncServer::new();
        server
            .push(PushRequest {
                store_id: "a".to_string(),
                expected_head: 0,
                events: vec![push_event("e1", 1)],
            })
            .await
            .unwrap();

        let outcome = server
            .push(PushRequest {
                store_id: "b".to_string(),
                expected_head: 0,
                events: vec![push_event("e2", 1)],
            })
            .await
            .unwrap();

        match outcome {
            PushOutcome::Conflict {
                head,
                reason,
                missing,
            } => {
                assert_eq!(head, 1);
                assert_eq!(reason, ConflictReason::ServerAhead);
                assert_eq!(missing.len(), 1);
                assert_eq!(missing[0].event_id, "e1");
            }
            _ => panic!("expected conflict"),
        }
    }

    #[tokio::test]
    async fn test_future_head_is_server_behind() {
        let server = InMemorySyncServer::new();
        let outcome = server
            .push(PushRequest {
                store_id: "a".to_string(),
                expected_head: 5,
                events: vec![push_event("e1", 1)],
            })
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            PushOutcome::Conflict {
                reason: ConflictReason::ServerBehind,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_pull_pages_with_next_since() {
        let server = InMemorySyncServer::new();
        server
            .push(PushRequest {
                store_id: "a".to_string(),
                expected_head: 0,
                events: vec![push_event("e1", 1), push_event("e2", 2), push_event("e3", 3)],
            })
            .await
            .unwrap();

        let page = server
            .pull(PullRequest {
                store_id: "b".to_string(),
                since: 0,
                limit: 2,
                wait_ms: None,
            })
            .await
            .unwrap();

        assert_eq!(page.events.len(), 2);
        assert!(page.has_more);
        assert_eq!(page.next_since, Some(2));

        let rest = server
            .pull(PullRequest {
                store_id: "b".to_string(),
                since: 2,
                limit: 2,
                wait_ms: None,
            })
            .await
            .unwrap();
        assert_eq!(rest.events.len(), 1);
        assert!(!rest.has_more);
    }

    #[tokio::test]
    async fn test_duplicate_push_reuses_assignment() {
        let server = InMemorySyncServer::new();
        server
            .push(PushRequest {
                store_id: "a".to_string(),
                expected_head: 0,
                events: vec![push_event("e1", 1)],
            })
            .await
            .unwrap();

        let outcome = server
            .push(PushRequest {
                store_id: "a".to_string(),
                expected_head: 1,
                events: vec![push_event("e1", 1)],
            })
            .await
            .unwrap();

        match outcome {
            PushOutcome::Ok { head, assigned } => {
                assert_eq!(head, 1);
                assert_eq!(assigned[0].global_sequence, 1);
            }
            _ => panic!("expected ok"),
        }
    }
}
