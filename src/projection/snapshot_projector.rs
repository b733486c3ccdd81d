//! Snapshot projector
//!
//! Per-aggregate-type projector: folds each aggregate's events into an
//! in-memory snapshot, maintains the active list items, and persists the
//! encrypted snapshot state per aggregate into the projection cache.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;

use crate::codec::aad;
use crate::codec::envelope::SnapshotEnvelope;
use crate::domain::{Aggregate, HasListItem};

use super::{
    EffectiveCursor, EventDecoder, ProjectionCacheRecord, ProjectionCacheStore, ProjectionError,
    ProjectionEventRow, ProjectionOrdering, ProjectionProcessor,
};

/// Snapshot projector for one aggregate type.
pub struct SnapshotProjector<A: Aggregate + HasListItem> {
    projection_id: String,
    ordering: ProjectionOrdering,
    decoder: EventDecoder,
    cache: ProjectionCacheStore,
    snapshots: HashMap<String, A>,
    projections: HashMap<String, A::Item>,
}

impl<A: Aggregate + HasListItem> SnapshotProjector<A> {
    pub fn new(
        projection_id: impl Into<String>,
        ordering: ProjectionOrdering,
        decoder: EventDecoder,
        cache: ProjectionCacheStore,
    ) -> Self {
        Self {
            projection_id: projection_id.into(),
            ordering,
            decoder,
            cache,
            snapshots: HashMap::new(),
            projections: HashMap::new(),
        }
    }

    /// Active list items, unordered.
    pub fn list_items(&self) -> Vec<A::Item> {
        self.projections.values().cloned().collect()
    }

    /// Current in-memory snapshot for one aggregate.
    pub fn snapshot(&self, aggregate_id: &str) -> Option<&A> {
        self.snapshots.get(aggregate_id)
    }

    pub fn item(&self, aggregate_id: &str) -> Option<&A::Item> {
        self.projections.get(aggregate_id)
    }

    async fn persist_snapshot(
        &self,
        aggregate_id: &str,
        state: &A,
        cursor: EffectiveCursor,
        last_commit_sequence: i64,
    ) -> Result<(), ProjectionError> {
        let key = self
            .decoder
            .keyring()
            .ensure_aggregate_key(aggregate_id)
            .await?
            .key;

        let envelope = SnapshotEnvelope::latest(
            serde_json::to_value(state).map_err(crate::codec::CodecError::Serialization)?,
        );
        let cache_version = state.version();

        let ciphertext = self.decoder.crypto().encrypt(
            &envelope.encode()?,
            &key,
            &aad::projection_cache(
                &self.projection_id,
                aggregate_id,
                cache_version,
                cursor.global_sequence,
                cursor.pending_commit_sequence,
            ),
        )?;

        self.cache
            .put(&ProjectionCacheRecord {
                projection_id: self.projection_id.clone(),
                scope_key: aggregate_id.to_string(),
                cache_version,
                cache_encrypted: ciphertext,
                ordering: self.ordering,
                cursor,
                last_commit_sequence,
                written_at: Utc::now(),
            })
            .await
    }
}

#[async_trait]
impl<A> ProjectionProcessor for SnapshotProjector<A>
where
    A: Aggregate + HasListItem + Sync,
{
    fn projection_id(&self) -> &str {
        &self.projection_id
    }

    async fn apply_event(
        &mut self,
        event: &ProjectionEventRow,
        cursor_after: EffectiveCursor,
        _last_commit_sequence: i64,
    ) -> Result<(), ProjectionError> {
        let Some(typed) = self.decoder.decode::<A::Event>(event).await? else {
            return Ok(());
        };

        let state = self
            .snapshots
            .remove(&event.aggregate_id)
            .unwrap_or_default()
            .apply(typed);

        match state.list_item() {
            Some(item) => {
                self.projections.insert(event.aggregate_id.clone(), item);
            }
            None => {
                // Archived aggregates leave the list; the snapshot remains.
                self.projections.remove(&event.aggregate_id);
            }
        }

        self.persist_snapshot(&event.aggregate_id, &state, cursor_after, event.commit_sequence)
            .await?;
        self.snapshots.insert(event.aggregate_id.clone(), state);

        Ok(())
    }

    async fn reset(&mut self) -> Result<(), ProjectionError> {
        self.snapshots.clear();
        self.projections.clear();
        let wiped = self.cache.purge(&self.projection_id).await?;
        tracing::debug!(
            projection_id = %self.projection_id,
            wiped = wiped,
            "Snapshot projector reset"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::codec::envelope::UpcasterRegistry;
    use crate::crypto::{ChaChaBoxCrypto, CryptoService, KeyringManager, SqliteKeyStore};
    use crate::db::LocalDb;
    use crate::domain::{EventContext, Goal};
    use crate::event_store::{EventAppender, Repository, SnapshotStore};
    use crate::projection::{ProjectionRuntime, ProjectionOrdering};
    use crate::domain::AggregateType;

    struct Fixture {
        db: LocalDb,
        repository: Repository<Goal>,
        decoder: EventDecoder,
    }

    async fn fixture() -> Fixture {
        let db = LocalDb::connect("sqlite::memory:").await.unwrap();
        let crypto: Arc<dyn CryptoService> = Arc::new(ChaChaBoxCrypto::new());
        let master_key = crypto.generate_key();
        let key_store = Arc::new(SqliteKeyStore::new(
            db.pool().clone(),
            crypto.clone(),
            master_key.clone(),
        ));
        let keyring = Arc::new(KeyringManager::new(key_store, crypto.clone(), master_key));
        let upcasters = Arc::new(UpcasterRegistry::new());

        let repository = Repository::new(
            EventAppender::new(db.clone()),
            SnapshotStore::new(db.clone()),
            crypto.clone(),
            keyring.clone(),
            upcasters.clone(),
        );
        let decoder = EventDecoder::new(crypto, keyring, upcasters);

        Fixture {
            db,
            repository,
            decoder,
        }
    }

    #[tokio::test]
    async fn test_projects_created_goal_into_list() {
        let fx = fixture().await;

        let (_, created) = Goal::create("goal-1", "Run a marathon", "health", "2026-10");
        fx.repository
            .save(Goal::default(), vec![created], None, &EventContext::new())
            .await
            .unwrap();

        let projector = SnapshotProjector::<Goal>::new(
            "goal-snapshots",
            ProjectionOrdering::EffectiveTotalOrder,
            fx.decoder.clone(),
            ProjectionCacheStore::new(fx.db.clone()),
        );
        let runtime = ProjectionRuntime::new(
            fx.db.clone(),
            Some(AggregateType::Goal),
            ProjectionOrdering::EffectiveTotalOrder,
            250,
            projector,
        );
        runtime.catch_up().await.unwrap();

        let processor = runtime.processor().await;
        let items = processor.list_items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Run a marathon");

        // Encrypted cache row exists for the aggregate scope.
        drop(processor);
        let row = ProjectionCacheStore::new(fx.db.clone())
            .get("goal-snapshots", "goal-1")
            .await
            .unwrap();
        assert!(row.is_some());
    }

    #[tokio::test]
    async fn test_archive_removes_item_but_keeps_snapshot() {
        let fx = fixture().await;

        let (goal, created) = Goal::create("goal-1", "Run a marathon", "health", "2026-10");
        let archive = goal.archive().unwrap();
        fx.repository
            .save(
                Goal::default(),
                vec![created, archive],
                None,
                &EventContext::new(),
            )
            .await
            .unwrap();

        let projector = SnapshotProjector::<Goal>::new(
            "goal-snapshots",
            ProjectionOrdering::EffectiveTotalOrder,
            fx.decoder.clone(),
            ProjectionCacheStore::new(fx.db.clone()),
        );
        let runtime = ProjectionRuntime::new(
            fx.db.clone(),
            Some(AggregateType::Goal),
            ProjectionOrdering::EffectiveTotalOrder,
            250,
            projector,
        );
        runtime.catch_up().await.unwrap();

        let processor = runtime.processor().await;
        assert!(processor.list_items().is_empty());
        let snapshot = processor.snapshot("goal-1").unwrap();
        assert!(snapshot.is_archived());
        assert!(snapshot.archived_at().is_some());
    }
}
