//! Projection meta store
//!
//! Durable cursor and phase per projection.

use chrono::{DateTime, Utc};

use crate::db::LocalDb;

use super::{EffectiveCursor, ProjectionError, ProjectionOrdering, ProjectionPhase};

/// Durable state of one projection.
#[derive(Debug, Clone)]
pub struct ProjectionMeta {
    pub projection_id: String,
    pub ordering: ProjectionOrdering,
    pub cursor: EffectiveCursor,
    pub last_commit_sequence: i64,
    pub phase: ProjectionPhase,
    pub updated_at: DateTime<Utc>,
}

impl ProjectionMeta {
    /// Fresh meta for a projection that has consumed nothing.
    pub fn zero(projection_id: &str, ordering: ProjectionOrdering) -> Self {
        Self {
            projection_id: projection_id.to_string(),
            ordering,
            cursor: EffectiveCursor::ZERO,
            last_commit_sequence: 0,
            phase: ProjectionPhase::Idle,
            updated_at: Utc::now(),
        }
    }
}

/// Store for projection meta rows.
#[derive(Debug, Clone)]
pub struct ProjectionMetaStore {
    db: LocalDb,
}

impl ProjectionMetaStore {
    pub fn new(db: LocalDb) -> Self {
        Self { db }
    }

    pub async fn get(&self, projection_id: &str) -> Result<Option<ProjectionMeta>, ProjectionError> {
        let row: Option<(String, i64, i64, i64, String, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT ordering, last_global_seq, last_pending_commit_seq,
                   last_commit_sequence, phase, updated_at
            FROM projection_meta
            WHERE projection_id = ?1
            "#,
        )
        .bind(projection_id)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(row.map(
            |(ordering, global_seq, pending_commit_seq, last_commit_sequence, phase, updated_at)| {
                ProjectionMeta {
                    projection_id: projection_id.to_string(),
                    ordering: ProjectionOrdering::parse(&ordering)
                        .unwrap_or(ProjectionOrdering::CommitSequence),
                    cursor: EffectiveCursor::new(global_seq, pending_commit_seq),
                    last_commit_sequence,
                    phase: ProjectionPhase::parse(&phase).unwrap_or(ProjectionPhase::Idle),
                    updated_at,
                }
            },
        ))
    }

    pub async fn put(&self, meta: &ProjectionMeta) -> Result<(), ProjectionError> {
        sqlx::query(
            r#"
            INSERT INTO projection_meta (
                projection_id, ordering, last_global_seq, last_pending_commit_seq,
                last_commit_sequence, phase, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT (projection_id)
            DO UPDATE SET
                ordering = ?2,
                last_global_seq = ?3,
                last_pending_commit_seq = ?4,
                last_commit_sequence = ?5,
                phase = ?6,
                updated_at = ?7
            "#,
        )
        .bind(&meta.projection_id)
        .bind(meta.ordering.as_str())
        .bind(meta.cursor.global_sequence)
        .bind(meta.cursor.pending_commit_sequence)
        .bind(meta.last_commit_sequence)
        .bind(meta.phase.as_str())
        .bind(Utc::now())
        .execute(self.db.pool())
        .await?;

        Ok(())
    }

    /// Smallest `last_commit_sequence` across all projections, if any
    /// projection meta exists. Drives the pruning window.
    pub async fn min_last_commit_sequence(&self) -> Result<Option<i64>, ProjectionError> {
        let min: Option<i64> =
            sqlx::query_scalar("SELECT MIN(last_commit_sequence) FROM projection_meta")
                .fetch_one(self.db.pool())
                .await?;
        Ok(min)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let store = ProjectionMetaStore::new(LocalDb::connect("sqlite::memory:").await.unwrap());
        assert!(store.get("goal-snapshots").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_then_get_round_trips() {
        let store = ProjectionMetaStore::new(LocalDb::connect("sqlite::memory:").await.unwrap());

        let mut meta = ProjectionMeta::zero("goal-snapshots", ProjectionOrdering::EffectiveTotalOrder);
        meta.cursor = EffectiveCursor::new(12, 3);
        meta.last_commit_sequence = 40;
        meta.phase = ProjectionPhase::CatchingUp;
        store.put(&meta).await.unwrap();

        let loaded = store.get("goal-snapshots").await.unwrap().unwrap();
        assert_eq!(loaded.cursor, EffectiveCursor::new(12, 3));
        assert_eq!(loaded.last_commit_sequence, 40);
        assert_eq!(loaded.phase, ProjectionPhase::CatchingUp);
        assert_eq!(loaded.ordering, ProjectionOrdering::EffectiveTotalOrder);
    }

    #[tokio::test]
    async fn test_min_last_commit_sequence() {
        let store = ProjectionMetaStore::new(LocalDb::connect("sqlite::memory:").await.unwrap());
        assert_eq!(store.min_last_commit_sequence().await.unwrap(), None);

        let mut a = ProjectionMeta::zero("a", ProjectionOrdering::CommitSequence);
        a.last_commit_sequence = 10;
        store.put(&a).await.unwrap();

        let mut b = ProjectionMeta::zero("b", ProjectionOrdering::CommitSequence);
        b.last_commit_sequence = 4;
        store.put(&b).await.unwrap();

        assert_eq!(store.min_last_commit_sequence().await.unwrap(), Some(4));
    }
}
