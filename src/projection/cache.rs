//! Projection cache and index artifact stores
//!
//! Encrypted blobs keyed by `(projection_id, scope_key)` and
//! `(index_id, scope_key)`. Projectors own the plaintext; these stores move
//! ciphertext and cursors.

use chrono::{DateTime, Utc};

use crate::db::{LocalDb, TABLE_INDEX_ARTIFACTS, TABLE_PROJECTION_CACHE};

use super::{EffectiveCursor, ProjectionError, ProjectionOrdering};

/// A persisted projection cache row.
#[derive(Debug, Clone)]
pub struct ProjectionCacheRecord {
    pub projection_id: String,
    pub scope_key: String,
    pub cache_version: i64,
    pub cache_encrypted: Vec<u8>,
    pub ordering: ProjectionOrdering,
    pub cursor: EffectiveCursor,
    pub last_commit_sequence: i64,
    pub written_at: DateTime<Utc>,
}

/// Store for projection cache rows.
#[derive(Debug, Clone)]
pub struct ProjectionCacheStore {
    db: LocalDb,
}

impl ProjectionCacheStore {
    pub fn new(db: LocalDb) -> Self {
        Self { db }
    }

    pub async fn put(&self, record: &ProjectionCacheRecord) -> Result<(), ProjectionError> {
        sqlx::query(
            r#"
            INSERT INTO projection_cache (
                projection_id, scope_key, cache_version, cache_encrypted, ordering,
                last_global_seq, last_pending_commit_seq, last_commit_sequence, written_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT (projection_id, scope_key)
            DO UPDATE SET
                cache_version = ?3,
                cache_encrypted = ?4,
                ordering = ?5,
                last_global_seq = ?6,
                last_pending_commit_seq = ?7,
                last_commit_sequence = ?8,
                written_at = ?9
            "#,
        )
        .bind(&record.projection_id)
        .bind(&record.scope_key)
        .bind(record.cache_version)
        .bind(&record.cache_encrypted)
        .bind(record.ordering.as_str())
        .bind(record.cursor.global_sequence)
        .bind(record.cursor.pending_commit_sequence)
        .bind(record.last_commit_sequence)
        .bind(record.written_at)
        .execute(self.db.pool())
        .await?;

        self.db.notify_table_changed(TABLE_PROJECTION_CACHE);
        Ok(())
    }

    pub async fn get(
        &self,
        projection_id: &str,
        scope_key: &str,
    ) -> Result<Option<ProjectionCacheRecord>, ProjectionError> {
        let row: Option<(i64, Vec<u8>, String, i64, i64, i64, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT cache_version, cache_encrypted, ordering, last_global_seq,
                   last_pending_commit_seq, last_commit_sequence, written_at
            FROM projection_cache
            WHERE projection_id = ?1 AND scope_key = ?2
            "#,
        )
        .bind(projection_id)
        .bind(scope_key)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(row.map(
            |(cache_version, cache_encrypted, ordering, gs, pc, last_commit_sequence, written_at)| {
                ProjectionCacheRecord {
                    projection_id: projection_id.to_string(),
                    scope_key: scope_key.to_string(),
                    cache_version,
                    cache_encrypted,
                    ordering: ProjectionOrdering::parse(&ordering)
                        .unwrap_or(ProjectionOrdering::CommitSequence),
                    cursor: EffectiveCursor::new(gs, pc),
                    last_commit_sequence,
                    written_at,
                }
            },
        ))
    }

    /// All rows for one projection.
    pub async fn list(
        &self,
        projection_id: &str,
    ) -> Result<Vec<ProjectionCacheRecord>, ProjectionError> {
        let rows: Vec<(String, i64, Vec<u8>, String, i64, i64, i64, DateTime<Utc>)> =
            sqlx::query_as(
                r#"
                SELECT scope_key, cache_version, cache_encrypted, ordering, last_global_seq,
                       last_pending_commit_seq, last_commit_sequence, written_at
                FROM projection_cache
                WHERE projection_id = ?1
                ORDER BY scope_key
                "#,
            )
            .bind(projection_id)
            .fetch_all(self.db.pool())
            .await?;

        Ok(rows
            .into_iter()
            .map(
                |(scope_key, cache_version, cache_encrypted, ordering, gs, pc, lcs, written_at)| {
                    ProjectionCacheRecord {
                        projection_id: projection_id.to_string(),
                        scope_key,
                        cache_version,
                        cache_encrypted,
                        ordering: ProjectionOrdering::parse(&ordering)
                            .unwrap_or(ProjectionOrdering::CommitSequence),
                        cursor: EffectiveCursor::new(gs, pc),
                        last_commit_sequence: lcs,
                        written_at,
                    }
                },
            )
            .collect())
    }

    pub async fn delete(
        &self,
        projection_id: &str,
        scope_key: &str,
    ) -> Result<bool, ProjectionError> {
        let rows = sqlx::query(
            "DELETE FROM projection_cache WHERE projection_id = ?1 AND scope_key = ?2",
        )
        .bind(projection_id)
        .bind(scope_key)
        .execute(self.db.pool())
        .await?
        .rows_affected();

        if rows > 0 {
            self.db.notify_table_changed(TABLE_PROJECTION_CACHE);
        }
        Ok(rows > 0)
    }

    /// Wipe all rows for a projection (rebuild path).
    pub async fn purge(&self, projection_id: &str) -> Result<u64, ProjectionError> {
        let rows = sqlx::query("DELETE FROM projection_cache WHERE projection_id = ?1")
            .bind(projection_id)
            .execute(self.db.pool())
            .await?
            .rows_affected();

        if rows > 0 {
            self.db.notify_table_changed(TABLE_PROJECTION_CACHE);
        }
        Ok(rows)
    }
}

/// A persisted index artifact row.
#[derive(Debug, Clone)]
pub struct IndexArtifactRecord {
    pub index_id: String,
    pub scope_key: String,
    pub artifact_version: i64,
    pub artifact_encrypted: Vec<u8>,
    pub cursor: EffectiveCursor,
    pub written_at: DateTime<Utc>,
}

/// Store for search index artifacts.
#[derive(Debug, Clone)]
pub struct IndexArtifactStore {
    db: LocalDb,
}

impl IndexArtifactStore {
    pub fn new(db: LocalDb) -> Self {
        Self { db }
    }

    pub async fn put(&self, record: &IndexArtifactRecord) -> Result<(), ProjectionError> {
        sqlx::query(
            r#"
            INSERT INTO index_artifacts (
                index_id, scope_key, artifact_version, artifact_encrypted,
                last_global_seq, last_pending_commit_seq, written_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT (index_id, scope_key)
            DO UPDATE SET
                artifact_version = ?3,
                artifact_encrypted = ?4,
                last_global_seq = ?5,
                last_pending_commit_seq = ?6,
                written_at = ?7
            "#,
        )
        .bind(&record.index_id)
        .bind(&record.scope_key)
        .bind(record.artifact_version)
        .bind(&record.artifact_encrypted)
        .bind(record.cursor.global_sequence)
        .bind(record.cursor.pending_commit_sequence)
        .bind(record.written_at)
        .execute(self.db.pool())
        .await?;

        self.db.notify_table_changed(TABLE_INDEX_ARTIFACTS);
        Ok(())
    }

    pub async fn get(
        &self,
        index_id: &str,
        scope_key: &str,
    ) -> Result<Option<IndexArtifactRecord>, ProjectionError> {
        let row: Option<(i64, Vec<u8>, i64, i64, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT artifact_version, artifact_encrypted, last_global_seq,
                   last_pending_commit_seq, written_at
            FROM index_artifacts
            WHERE index_id = ?1 AND scope_key = ?2
            "#,
        )
        .bind(index_id)
        .bind(scope_key)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(row.map(
            |(artifact_version, artifact_encrypted, gs, pc, written_at)| IndexArtifactRecord {
                index_id: index_id.to_string(),
                scope_key: scope_key.to_string(),
                artifact_version,
                artifact_encrypted,
                cursor: EffectiveCursor::new(gs, pc),
                written_at,
            },
        ))
    }

    pub async fn delete(&self, index_id: &str, scope_key: &str) -> Result<bool, ProjectionError> {
        let rows =
            sqlx::query("DELETE FROM index_artifacts WHERE index_id = ?1 AND scope_key = ?2")
                .bind(index_id)
                .bind(scope_key)
                .execute(self.db.pool())
                .await?
                .rows_affected();

        if rows > 0 {
            self.db.notify_table_changed(TABLE_INDEX_ARTIFACTS);
        }
        Ok(rows > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_record(scope: &str, version: i64) -> ProjectionCacheRecord {
        ProjectionCacheRecord {
            projection_id: "goal-snapshots".to_string(),
            scope_key: scope.to_string(),
            cache_version: version,
            cache_encrypted: vec![9, 9, 9],
            ordering: ProjectionOrdering::EffectiveTotalOrder,
            cursor: EffectiveCursor::new(7, 0),
            last_commit_sequence: 7,
            written_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_cache_put_get_upsert() {
        let store = ProjectionCacheStore::new(LocalDb::connect("sqlite::memory:").await.unwrap());

        store.put(&cache_record("goal-A", 1)).await.unwrap();
        store.put(&cache_record("goal-A", 2)).await.unwrap();

        let loaded = store.get("goal-snapshots", "goal-A").await.unwrap().unwrap();
        assert_eq!(loaded.cache_version, 2);
        assert_eq!(loaded.cursor, EffectiveCursor::new(7, 0));
    }

    #[tokio::test]
    async fn test_cache_purge_wipes_projection() {
        let store = ProjectionCacheStore::new(LocalDb::connect("sqlite::memory:").await.unwrap());
        store.put(&cache_record("goal-A", 1)).await.unwrap();
        store.put(&cache_record("goal-B", 1)).await.unwrap();

        assert_eq!(store.purge("goal-snapshots").await.unwrap(), 2);
        assert!(store.list("goal-snapshots").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_artifact_round_trip() {
        let store = IndexArtifactStore::new(LocalDb::connect("sqlite::memory:").await.unwrap());

        store
            .put(&IndexArtifactRecord {
                index_id: "goal-search".to_string(),
                scope_key: "all".to_string(),
                artifact_version: 1,
                artifact_encrypted: vec![1, 2, 3],
                cursor: EffectiveCursor::new(3, 5),
                written_at: Utc::now(),
            })
            .await
            .unwrap();

        let loaded = store.get("goal-search", "all").await.unwrap().unwrap();
        assert_eq!(loaded.cursor, EffectiveCursor::new(3, 5));
        assert!(store.delete("goal-search", "all").await.unwrap());
        assert!(store.get("goal-search", "all").await.unwrap().is_none());
    }
}
