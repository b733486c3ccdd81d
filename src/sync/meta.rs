//! Sync meta stores
//!
//! The per-store pull cursor and the event→global-sequence map. An event
//! without a map row is pending: committed locally, not yet accepted by the
//! server.

use chrono::Utc;

use crate::db::{LocalDb, TABLE_SYNC_EVENT_MAP};
use crate::event_store::StoredEventRow;

use super::SyncError;

const EVENT_COLUMNS: &str = "e.commit_sequence, e.id, e.aggregate_type, e.aggregate_id, \
     e.event_type, e.payload_encrypted, e.keyring_update, e.version, e.occurred_at, \
     e.actor_id, e.causation_id, e.correlation_id, e.epoch";

/// Store for the per-store sync cursor.
#[derive(Debug, Clone)]
pub struct SyncMetaStore {
    db: LocalDb,
}

impl SyncMetaStore {
    pub fn new(db: LocalDb) -> Self {
        Self { db }
    }

    /// Last pulled global sequence for a store, 0 if never synced.
    pub async fn last_pulled_global_seq(&self, store_id: &str) -> Result<i64, SyncError> {
        let seq: Option<i64> = sqlx::query_scalar(
            "SELECT last_pulled_global_seq FROM sync_meta WHERE store_id = ?1",
        )
        .bind(store_id)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(seq.unwrap_or(0))
    }

    pub async fn set_last_pulled_global_seq(
        &self,
        store_id: &str,
        seq: i64,
    ) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            INSERT INTO sync_meta (store_id, last_pulled_global_seq, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (store_id)
            DO UPDATE SET last_pulled_global_seq = ?2, updated_at = ?3
            "#,
        )
        .bind(store_id)
        .bind(seq)
        .bind(Utc::now())
        .execute(self.db.pool())
        .await?;

        Ok(())
    }
}

/// Store for the event→global-sequence map.
#[derive(Debug, Clone)]
pub struct SyncEventMapStore {
    db: LocalDb,
}

impl SyncEventMapStore {
    pub fn new(db: LocalDb) -> Self {
        Self { db }
    }

    /// Record an accepted event's global sequence. Idempotent.
    ///
    /// Returns true when a new mapping was inserted.
    pub async fn map_event(&self, event_id: &str, global_seq: i64) -> Result<bool, SyncError> {
        let rows = sqlx::query(
            r#"
            INSERT OR IGNORE INTO sync_event_map (event_id, global_seq, inserted_at)
            VALUES (?1, ?2, ?3)
            "#,
        )
        .bind(event_id)
        .bind(global_seq)
        .bind(Utc::now())
        .execute(self.db.pool())
        .await?
        .rows_affected();

        if rows > 0 {
            self.db.notify_table_changed(TABLE_SYNC_EVENT_MAP);
        }
        Ok(rows > 0)
    }

    pub async fn global_seq_for(&self, event_id: &str) -> Result<Option<i64>, SyncError> {
        let seq: Option<i64> =
            sqlx::query_scalar("SELECT global_seq FROM sync_event_map WHERE event_id = ?1")
                .bind(event_id)
                .fetch_optional(self.db.pool())
                .await?;
        Ok(seq)
    }

    /// Whether any local event is still pending.
    pub async fn has_pending(&self) -> Result<bool, SyncError> {
        let pending: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM events e
                WHERE NOT EXISTS (SELECT 1 FROM sync_event_map m WHERE m.event_id = e.id)
            )
            "#,
        )
        .fetch_one(self.db.pool())
        .await?;
        Ok(pending)
    }

    /// Pending events across all aggregates, oldest first.
    pub async fn pending_events(&self, limit: i64) -> Result<Vec<StoredEventRow>, SyncError> {
        let rows: Vec<StoredEventRow> = sqlx::query_as(&format!(
            r#"
            SELECT {EVENT_COLUMNS} FROM events e
            WHERE NOT EXISTS (SELECT 1 FROM sync_event_map m WHERE m.event_id = e.id)
            ORDER BY e.commit_sequence ASC
            LIMIT ?1
            "#
        ))
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows)
    }

    /// Pending events for one aggregate, newest version first.
    pub async fn pending_for_aggregate_desc(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        from_version: i64,
    ) -> Result<Vec<StoredEventRow>, SyncError> {
        let rows: Vec<StoredEventRow> = sqlx::query_as(&format!(
            r#"
            SELECT {EVENT_COLUMNS} FROM events e
            WHERE e.aggregate_type = ?1 AND e.aggregate_id = ?2 AND e.version >= ?3
              AND NOT EXISTS (SELECT 1 FROM sync_event_map m WHERE m.event_id = e.id)
            ORDER BY e.version DESC
            "#
        ))
        .bind(aggregate_type)
        .bind(aggregate_id)
        .bind(from_version)
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows)
    }

    /// Highest mapped global sequence present locally.
    pub async fn max_mapped_global_seq(&self) -> Result<i64, SyncError> {
        let seq: Option<i64> = sqlx::query_scalar("SELECT MAX(global_seq) FROM sync_event_map")
            .fetch_one(self.db.pool())
            .await?;
        Ok(seq.unwrap_or(0))
    }
}
