//! Snapshot store
//!
//! Per-aggregate encrypted snapshots keyed by
//! `(aggregate_type, aggregate_id)`. Decryption belongs to the repository;
//! this store moves ciphertext.

use chrono::{DateTime, Utc};

use crate::db::{LocalDb, TABLE_SNAPSHOTS};
use crate::projection::EffectiveCursor;

use super::EventStoreError;

/// A persisted snapshot row.
#[derive(Debug, Clone)]
pub struct SnapshotRecord {
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub snapshot_version: i64,
    pub snapshot_encrypted: Vec<u8>,
    pub last_effective_cursor: EffectiveCursor,
    pub written_at: DateTime<Utc>,
}

/// Store for per-aggregate snapshots.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    db: LocalDb,
}

impl SnapshotStore {
    pub fn new(db: LocalDb) -> Self {
        Self { db }
    }

    /// Upsert the snapshot for an aggregate.
    pub async fn put(&self, record: &SnapshotRecord) -> Result<(), EventStoreError> {
        sqlx::query(
            r#"
            INSERT INTO snapshots (
                aggregate_type, aggregate_id, snapshot_version,
                snapshot_encrypted, last_effective_cursor, written_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (aggregate_type, aggregate_id)
            DO UPDATE SET
                snapshot_version = ?3,
                snapshot_encrypted = ?4,
                last_effective_cursor = ?5,
                written_at = ?6
            "#,
        )
        .bind(&record.aggregate_type)
        .bind(&record.aggregate_id)
        .bind(record.snapshot_version)
        .bind(&record.snapshot_encrypted)
        .bind(record.last_effective_cursor.encode())
        .bind(record.written_at)
        .execute(self.db.pool())
        .await?;

        self.db.notify_table_changed(TABLE_SNAPSHOTS);
        Ok(())
    }

    /// Latest snapshot for an aggregate, or `None`.
    pub async fn get(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<Option<SnapshotRecord>, EventStoreError> {
        let row: Option<(i64, Vec<u8>, String, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT snapshot_version, snapshot_encrypted, last_effective_cursor, written_at
            FROM snapshots
            WHERE aggregate_type = ?1 AND aggregate_id = ?2
            "#,
        )
        .bind(aggregate_type)
        .bind(aggregate_id)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(row.map(
            |(snapshot_version, snapshot_encrypted, cursor, written_at)| SnapshotRecord {
                aggregate_type: aggregate_type.to_string(),
                aggregate_id: aggregate_id.to_string(),
                snapshot_version,
                snapshot_encrypted,
                last_effective_cursor: EffectiveCursor::decode(&cursor)
                    .unwrap_or(EffectiveCursor::ZERO),
                written_at,
            },
        ))
    }

    /// Remove the snapshot for an aggregate, if present.
    pub async fn purge(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<bool, EventStoreError> {
        let rows = sqlx::query(
            r#"
            DELETE FROM snapshots WHERE aggregate_type = ?1 AND aggregate_id = ?2
            "#,
        )
        .bind(aggregate_type)
        .bind(aggregate_id)
        .execute(self.db.pool())
        .await?
        .rows_affected();

        if rows > 0 {
            self.db.notify_table_changed(TABLE_SNAPSHOTS);
        }
        Ok(rows > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(version: i64) -> SnapshotRecord {
        SnapshotRecord {
            aggregate_type: "goal".to_string(),
            aggregate_id: "goal-A".to_string(),
            snapshot_version: version,
            snapshot_encrypted: vec![1, 2, 3],
            last_effective_cursor: EffectiveCursor::new(4, 0),
            written_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let store = SnapshotStore::new(LocalDb::connect("sqlite::memory:").await.unwrap());
        store.put(&record(3)).await.unwrap();

        let loaded = store.get("goal", "goal-A").await.unwrap().unwrap();
        assert_eq!(loaded.snapshot_version, 3);
        assert_eq!(loaded.last_effective_cursor, EffectiveCursor::new(4, 0));
    }

    #[tokio::test]
    async fn test_put_upserts_by_aggregate() {
        let store = SnapshotStore::new(LocalDb::connect("sqlite::memory:").await.unwrap());
        store.put(&record(3)).await.unwrap();
        store.put(&record(5)).await.unwrap();

        let loaded = store.get("goal", "goal-A").await.unwrap().unwrap();
        assert_eq!(loaded.snapshot_version, 5);
    }

    #[tokio::test]
    async fn test_purge_removes_row() {
        let store = SnapshotStore::new(LocalDb::connect("sqlite::memory:").await.unwrap());
        store.put(&record(3)).await.unwrap();

        assert!(store.purge("goal", "goal-A").await.unwrap());
        assert!(store.get("goal", "goal-A").await.unwrap().is_none());
        assert!(!store.purge("goal", "goal-A").await.unwrap());
    }
}
