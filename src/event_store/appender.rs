//! Encrypted event appender
//!
//! Validates `known_version`, enforces contiguous
//! `(aggregate_type, aggregate_id, version)` streams, and assigns the local
//! `commit_sequence` at insert. Payloads arrive here already encrypted; the
//! appender never sees plaintext.

use sqlx::Sqlite;

use crate::db::{LocalDb, TABLE_EVENTS};

use super::EventStoreError;

/// An event ready for insertion. The payload is AEAD ciphertext.
#[derive(Debug, Clone)]
pub struct NewEncryptedEvent {
    pub event_id: String,
    pub event_type: String,
    pub payload_encrypted: Vec<u8>,
    pub keyring_update: Option<Vec<u8>>,
    pub version: i64,
    pub occurred_at: i64,
    pub actor_id: Option<String>,
    pub causation_id: Option<String>,
    pub correlation_id: Option<String>,
    pub epoch: Option<i64>,
}

/// A persisted event row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredEventRow {
    pub commit_sequence: i64,
    pub id: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload_encrypted: Vec<u8>,
    pub keyring_update: Option<Vec<u8>>,
    pub version: i64,
    pub occurred_at: i64,
    pub actor_id: Option<String>,
    pub causation_id: Option<String>,
    pub correlation_id: Option<String>,
    pub epoch: Option<i64>,
}

const SELECT_COLUMNS: &str = "commit_sequence, id, aggregate_type, aggregate_id, event_type, \
     payload_encrypted, keyring_update, version, occurred_at, actor_id, causation_id, \
     correlation_id, epoch";

/// Appender over the local encrypted log.
#[derive(Debug, Clone)]
pub struct EventAppender {
    db: LocalDb,
}

impl EventAppender {
    pub fn new(db: LocalDb) -> Self {
        Self { db }
    }

    /// Highest persisted version for an aggregate, 0 if none.
    pub async fn max_version(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<i64, EventStoreError> {
        let version: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT MAX(version) FROM events
            WHERE aggregate_type = ?1 AND aggregate_id = ?2
            "#,
        )
        .bind(aggregate_type)
        .bind(aggregate_id)
        .fetch_one(self.db.pool())
        .await?;

        Ok(version.unwrap_or(0))
    }

    /// Append a batch of events for one aggregate.
    ///
    /// Versions must be contiguous starting at `max_version + 1`; a stale
    /// `known_version` or a version collision maps to
    /// [`EventStoreError::ConcurrencyConflict`]. The whole batch is one
    /// transaction. Returns the stored rows with their assigned commit
    /// sequences.
    pub async fn append_for_aggregate(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        known_version: Option<i64>,
        events: Vec<NewEncryptedEvent>,
    ) -> Result<Vec<StoredEventRow>, EventStoreError> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        for window in events.windows(2) {
            if window[1].version != window[0].version + 1 {
                return Err(EventStoreError::InvalidBatch(format!(
                    "versions not contiguous: v{} followed by v{}",
                    window[0].version, window[1].version
                )));
            }
        }

        let mut tx = self.db.pool().begin().await?;

        let actual: i64 = sqlx::query_scalar::<Sqlite, Option<i64>>(
            r#"
            SELECT MAX(version) FROM events
            WHERE aggregate_type = ?1 AND aggregate_id = ?2
            "#,
        )
        .bind(aggregate_type)
        .bind(aggregate_id)
        .fetch_one(&mut *tx)
        .await?
        .unwrap_or(0);

        if let Some(known) = known_version {
            if known != actual {
                return Err(EventStoreError::ConcurrencyConflict {
                    aggregate_type: aggregate_type.to_string(),
                    aggregate_id: aggregate_id.to_string(),
                    expected: known,
                    actual,
                });
            }
        }

        let expected_start = actual + 1;
        if events[0].version != expected_start {
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_type: aggregate_type.to_string(),
                aggregate_id: aggregate_id.to_string(),
                expected: events[0].version,
                actual,
            });
        }

        let mut commit_sequences = Vec::with_capacity(events.len());
        for event in &events {
            let result = sqlx::query(
                r#"
                INSERT INTO events (
                    id, aggregate_type, aggregate_id, event_type,
                    payload_encrypted, keyring_update, version, occurred_at,
                    actor_id, causation_id, correlation_id, epoch
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                "#,
            )
            .bind(&event.event_id)
            .bind(aggregate_type)
            .bind(aggregate_id)
            .bind(&event.event_type)
            .bind(&event.payload_encrypted)
            .bind(&event.keyring_update)
            .bind(event.version)
            .bind(event.occurred_at)
            .bind(&event.actor_id)
            .bind(&event.causation_id)
            .bind(&event.correlation_id)
            .bind(event.epoch)
            .execute(&mut *tx)
            .await;

            match result {
                Ok(done) => commit_sequences.push(done.last_insert_rowid()),
                Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                    return Err(EventStoreError::ConcurrencyConflict {
                        aggregate_type: aggregate_type.to_string(),
                        aggregate_id: aggregate_id.to_string(),
                        expected: event.version,
                        actual,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }

        tx.commit().await?;
        self.db.notify_table_changed(TABLE_EVENTS);

        tracing::debug!(
            aggregate_type = %aggregate_type,
            aggregate_id = %aggregate_id,
            appended = events.len(),
            first_version = events[0].version,
            "Appended events"
        );

        Ok(events
            .into_iter()
            .zip(commit_sequences)
            .map(|(event, commit_sequence)| StoredEventRow {
                commit_sequence,
                id: event.event_id,
                aggregate_type: aggregate_type.to_string(),
                aggregate_id: aggregate_id.to_string(),
                event_type: event.event_type,
                payload_encrypted: event.payload_encrypted,
                keyring_update: event.keyring_update,
                version: event.version,
                occurred_at: event.occurred_at,
                actor_id: event.actor_id,
                causation_id: event.causation_id,
                correlation_id: event.correlation_id,
                epoch: event.epoch,
            })
            .collect())
    }

    /// Events for an aggregate with `version > after_version`, ascending.
    pub async fn events_after_version(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        after_version: i64,
    ) -> Result<Vec<StoredEventRow>, EventStoreError> {
        let rows: Vec<StoredEventRow> = sqlx::query_as(&format!(
            r#"
            SELECT {SELECT_COLUMNS} FROM events
            WHERE aggregate_type = ?1 AND aggregate_id = ?2 AND version > ?3
            ORDER BY version ASC
            "#
        ))
        .bind(aggregate_type)
        .bind(aggregate_id)
        .bind(after_version)
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows)
    }

    /// All events for an aggregate, ascending by version.
    pub async fn events_for_aggregate(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<Vec<StoredEventRow>, EventStoreError> {
        self.events_after_version(aggregate_type, aggregate_id, 0)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str, version: i64) -> NewEncryptedEvent {
        NewEncryptedEvent {
            event_id: id.to_string(),
            event_type: "GoalRenamed".to_string(),
            payload_encrypted: vec![0u8; 32],
            keyring_update: None,
            version,
            occurred_at: 1_700_000_000_000,
            actor_id: Some("actor-1".to_string()),
            causation_id: None,
            correlation_id: None,
            epoch: Some(1),
        }
    }

    async fn appender() -> EventAppender {
        let db = LocalDb::connect("sqlite::memory:").await.unwrap();
        EventAppender::new(db)
    }

    #[tokio::test]
    async fn test_append_assigns_monotonic_commit_sequences() {
        let appender = appender().await;

        let rows = appender
            .append_for_aggregate(
                "goal",
                "goal-A",
                None,
                vec![event("e1", 1), event("e2", 2), event("e3", 3)],
            )
            .await
            .unwrap();

        let sequences: Vec<i64> = rows.iter().map(|r| r.commit_sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);

        let rows = appender
            .append_for_aggregate("goal", "goal-A", Some(3), vec![event("e4", 4)])
            .await
            .unwrap();
        assert_eq!(rows[0].commit_sequence, 4);
    }

    #[tokio::test]
    async fn test_stale_known_version_is_a_conflict() {
        let appender = appender().await;
        appender
            .append_for_aggregate("goal", "goal-A", None, vec![event("e1", 1), event("e2", 2)])
            .await
            .unwrap();

        let result = appender
            .append_for_aggregate("goal", "goal-A", Some(1), vec![event("e3", 3)])
            .await;

        match result {
            Err(EventStoreError::ConcurrencyConflict { expected, actual, .. }) => {
                assert_eq!(expected, 1);
                assert_eq!(actual, 2);
            }
            other => panic!("expected conflict, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_duplicate_version_is_a_conflict() {
        let appender = appender().await;
        appender
            .append_for_aggregate("goal", "goal-A", None, vec![event("e1", 1), event("e2", 2)])
            .await
            .unwrap();

        let result = appender
            .append_for_aggregate("goal", "goal-A", None, vec![event("e2b", 2)])
            .await;
        assert!(matches!(
            result,
            Err(EventStoreError::ConcurrencyConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_empty_batch_is_a_no_op() {
        let appender = appender().await;
        let rows = appender
            .append_for_aggregate("goal", "goal-A", None, vec![])
            .await
            .unwrap();
        assert!(rows.is_empty());
        assert_eq!(appender.max_version("goal", "goal-A").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_conflicting_batch_leaves_no_partial_rows() {
        let appender = appender().await;
        appender
            .append_for_aggregate("goal", "goal-A", None, vec![event("e1", 1)])
            .await
            .unwrap();

        // v2 is fine, v1 collides; the whole batch must roll back.
        let result = appender
            .append_for_aggregate("goal", "goal-A", None, vec![event("e2", 2)])
            .await;
        assert!(result.is_ok());

        let result = appender
            .append_for_aggregate(
                "goal",
                "goal-B",
                None,
                vec![event("b1", 1), event("e2", 2)],
            )
            .await;
        // Duplicate event id on the second row aborts the whole batch.
        assert!(result.is_err());
        assert_eq!(appender.max_version("goal", "goal-B").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_non_contiguous_batch_rejected() {
        let appender = appender().await;
        let result = appender
            .append_for_aggregate("goal", "goal-A", None, vec![event("e1", 1), event("e3", 3)])
            .await;
        assert!(matches!(result, Err(EventStoreError::InvalidBatch(_))));
    }

    #[tokio::test]
    async fn test_wrong_start_version_is_a_conflict() {
        let appender = appender().await;
        let result = appender
            .append_for_aggregate("goal", "goal-A", None, vec![event("e2", 2)])
            .await;
        assert!(matches!(
            result,
            Err(EventStoreError::ConcurrencyConflict { expected: 2, actual: 0, .. })
        ));
    }
}
