//! Idempotency store
//!
//! Caller-supplied keys make commands at-most-once under retries. A key
//! recorded twice with identical `(command_type, aggregate_id)` is a no-op;
//! reuse with different metadata is a fatal typed error.

use chrono::{DateTime, Utc};

use crate::db::LocalDb;

use super::EventStoreError;

/// A recorded idempotency key.
#[derive(Debug, Clone)]
pub struct IdempotencyRecord {
    pub key: String,
    pub command_type: String,
    pub aggregate_id: String,
    pub created_at: DateTime<Utc>,
}

/// Outcome of recording a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdempotencyOutcome {
    /// First time this key was seen
    Recorded,
    /// Key already recorded with identical metadata
    AlreadyRecorded,
}

/// Store for idempotency keys.
#[derive(Debug, Clone)]
pub struct IdempotencyStore {
    db: LocalDb,
}

impl IdempotencyStore {
    pub fn new(db: LocalDb) -> Self {
        Self { db }
    }

    /// Record a key for a command.
    pub async fn record(
        &self,
        key: &str,
        command_type: &str,
        aggregate_id: &str,
    ) -> Result<IdempotencyOutcome, EventStoreError> {
        if let Some(existing) = self.get(key).await? {
            if existing.command_type == command_type && existing.aggregate_id == aggregate_id {
                return Ok(IdempotencyOutcome::AlreadyRecorded);
            }
            return Err(EventStoreError::IdempotencyReuse {
                key: key.to_string(),
            });
        }

        sqlx::query(
            r#"
            INSERT INTO idempotency_keys (key, command_type, aggregate_id, created_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(key)
        .bind(command_type)
        .bind(aggregate_id)
        .bind(Utc::now())
        .execute(self.db.pool())
        .await?;

        Ok(IdempotencyOutcome::Recorded)
    }

    /// Fetch an existing record.
    pub async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, EventStoreError> {
        let row: Option<(String, String, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT command_type, aggregate_id, created_at
            FROM idempotency_keys
            WHERE key = ?1
            "#,
        )
        .bind(key)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(row.map(|(command_type, aggregate_id, created_at)| IdempotencyRecord {
            key: key.to_string(),
            command_type,
            aggregate_id,
            created_at,
        }))
    }

    /// Delete keys older than the cutoff; returns how many were removed.
    pub async fn delete_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, EventStoreError> {
        let rows = sqlx::query(
            r#"
            DELETE FROM idempotency_keys WHERE created_at < ?1
            "#,
        )
        .bind(cutoff)
        .execute(self.db.pool())
        .await?
        .rows_affected();

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> IdempotencyStore {
        IdempotencyStore::new(LocalDb::connect("sqlite::memory:").await.unwrap())
    }

    #[tokio::test]
    async fn test_first_record_is_recorded() {
        let store = store().await;
        let outcome = store
            .record("goal-achieve:g1:e1", "AchieveGoal", "g1")
            .await
            .unwrap();
        assert_eq!(outcome, IdempotencyOutcome::Recorded);
    }

    #[tokio::test]
    async fn test_identical_reuse_is_a_no_op() {
        let store = store().await;
        store
            .record("goal-achieve:g1:e1", "AchieveGoal", "g1")
            .await
            .unwrap();

        let outcome = store
            .record("goal-achieve:g1:e1", "AchieveGoal", "g1")
            .await
            .unwrap();
        assert_eq!(outcome, IdempotencyOutcome::AlreadyRecorded);
    }

    #[tokio::test]
    async fn test_mismatched_reuse_fails() {
        let store = store().await;
        store
            .record("goal-achieve:g1:e1", "AchieveGoal", "g1")
            .await
            .unwrap();

        let result = store
            .record("goal-achieve:g1:e1", "UnachieveGoal", "g1")
            .await;
        assert!(matches!(
            result,
            Err(EventStoreError::IdempotencyReuse { .. })
        ));

        let result = store.record("goal-achieve:g1:e1", "AchieveGoal", "g2").await;
        assert!(matches!(
            result,
            Err(EventStoreError::IdempotencyReuse { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_older_than() {
        let store = store().await;
        store.record("k1", "AchieveGoal", "g1").await.unwrap();

        let removed = store
            .delete_older_than(Utc::now() - chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(removed, 0);

        let removed = store
            .delete_older_than(Utc::now() + chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
    }
}
