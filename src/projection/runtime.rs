//! Projection runtime
//!
//! Per-aggregate-type scheduler: reads event batches in the configured
//! ordering, advances the durable cursor, dispatches to the projection
//! processor, and rebuilds from zero when a rebase invalidates derived
//! state.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::db::{LocalDb, TABLE_EVENTS, TABLE_SYNC_EVENT_MAP};
use crate::domain::AggregateType;

use super::{
    EffectiveCursor, ProjectionError, ProjectionMeta, ProjectionMetaStore, ProjectionOrdering,
    ProjectionPhase, ProjectionTaskRunner,
};

/// An event row as seen by projections: the stored event plus its global
/// sequence mapping, if the server has accepted it.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProjectionEventRow {
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
    pub global_sequence: Option<i64>,
}

impl ProjectionEventRow {
    pub fn is_pending(&self) -> bool {
        self.global_sequence.is_none()
    }
}

/// A projection processor fed by the runtime.
///
/// Delivery is at-least-once: processors must be idempotent with respect to
/// `(event id, cursor)`. Any event may be a no-op.
#[async_trait]
pub trait ProjectionProcessor: Send {
    fn projection_id(&self) -> &str;

    async fn apply_event(
        &mut self,
        event: &ProjectionEventRow,
        cursor_after: EffectiveCursor,
        last_commit_sequence: i64,
    ) -> Result<(), ProjectionError>;

    /// Called after each persisted batch.
    async fn on_batch_complete(&mut self, _cursor: EffectiveCursor) -> Result<(), ProjectionError> {
        Ok(())
    }

    /// Wipe all derived state; the runtime replays from the zero cursor.
    async fn reset(&mut self) -> Result<(), ProjectionError>;
}

/// Runtime driving one processor over an aggregate type's events.
///
/// Process managers that span streams pass `None` and see every aggregate
/// type in one ordering.
pub struct ProjectionRuntime<P: ProjectionProcessor> {
    db: LocalDb,
    aggregate_type: Option<AggregateType>,
    ordering: ProjectionOrdering,
    batch_size: i64,
    projection_id: String,
    processor: tokio::sync::Mutex<P>,
    meta_store: ProjectionMetaStore,
    runner: ProjectionTaskRunner,
}

impl<P: ProjectionProcessor + 'static> ProjectionRuntime<P> {
    pub fn new(
        db: LocalDb,
        aggregate_type: Option<AggregateType>,
        ordering: ProjectionOrdering,
        batch_size: i64,
        processor: P,
    ) -> Self {
        let projection_id = processor.projection_id().to_string();
        Self {
            meta_store: ProjectionMetaStore::new(db.clone()),
            db,
            aggregate_type,
            ordering,
            batch_size,
            projection_id,
            processor: tokio::sync::Mutex::new(processor),
            runner: ProjectionTaskRunner::new(),
        }
    }

    pub fn projection_id(&self) -> &str {
        &self.projection_id
    }

    /// Borrow the processor (for queries against its in-memory state).
    pub async fn processor(&self) -> tokio::sync::MutexGuard<'_, P> {
        self.processor.lock().await
    }

    /// Durable meta for this projection.
    pub async fn meta(&self) -> Result<ProjectionMeta, ProjectionError> {
        Ok(self
            .meta_store
            .get(&self.projection_id)
            .await?
            .unwrap_or_else(|| ProjectionMeta::zero(&self.projection_id, self.ordering)))
    }

    /// Catch up to the head of the log in the configured ordering.
    pub async fn catch_up(&self) -> Result<(), ProjectionError> {
        let mut processor = self.processor.lock().await;
        let mut meta = self.meta().await?;
        meta.ordering = self.ordering;
        self.drain(&mut processor, &mut meta).await
    }

    /// Reset derived state and replay everything from the zero cursor.
    ///
    /// Invoked when a rebase reordered local history; prior snapshots may
    /// have been computed from versions that no longer exist.
    pub async fn rebuild(&self) -> Result<(), ProjectionError> {
        let mut processor = self.processor.lock().await;

        let mut meta = ProjectionMeta::zero(&self.projection_id, self.ordering);
        meta.phase = ProjectionPhase::Rebuilding;
        self.meta_store.put(&meta).await?;

        processor.reset().await?;
        tracing::info!(projection_id = %self.projection_id, "Projection reset; rebuilding");

        self.drain(&mut processor, &mut meta).await
    }

    async fn drain(
        &self,
        processor: &mut P,
        meta: &mut ProjectionMeta,
    ) -> Result<(), ProjectionError> {
        if meta.phase != ProjectionPhase::Rebuilding {
            meta.phase = ProjectionPhase::CatchingUp;
        }
        self.meta_store.put(meta).await?;

        loop {
            let batch = self.read_batch(meta).await?;
            let batch_len = batch.len() as i64;

            for event in &batch {
                let cursor_after = meta
                    .cursor
                    .advance(event.global_sequence, event.commit_sequence);
                processor
                    .apply_event(event, cursor_after, meta.last_commit_sequence)
                    .await?;
                meta.cursor = cursor_after;
                meta.last_commit_sequence = meta.last_commit_sequence.max(event.commit_sequence);
            }

            self.meta_store.put(meta).await?;
            processor.on_batch_complete(meta.cursor).await?;

            // Cooperative scheduling: let the host task loop breathe
            // between batches.
            tokio::task::yield_now().await;

            if batch_len < self.batch_size {
                break;
            }
        }

        meta.phase = ProjectionPhase::Idle;
        self.meta_store.put(meta).await?;
        Ok(())
    }

    async fn read_batch(
        &self,
        meta: &ProjectionMeta,
    ) -> Result<Vec<ProjectionEventRow>, ProjectionError> {
        let rows = match self.ordering {
            ProjectionOrdering::CommitSequence => {
                sqlx::query_as::<_, ProjectionEventRow>(
                    r#"
                    SELECT e.commit_sequence, e.id, e.aggregate_type, e.aggregate_id,
                           e.event_type, e.payload_encrypted, e.keyring_update, e.version,
                           e.occurred_at, e.actor_id, e.causation_id, e.correlation_id,
                           e.epoch, m.global_seq AS global_sequence
                    FROM events e
                    LEFT JOIN sync_event_map m ON m.event_id = e.id
                    WHERE (?1 IS NULL OR e.aggregate_type = ?1) AND e.commit_sequence > ?2
                    ORDER BY e.commit_sequence ASC
                    LIMIT ?3
                    "#,
                )
                .bind(self.aggregate_type.map(|t| t.as_str()))
                .bind(meta.last_commit_sequence)
                .bind(self.batch_size)
                .fetch_all(self.db.pool())
                .await?
            }
            ProjectionOrdering::EffectiveTotalOrder => {
                sqlx::query_as::<_, ProjectionEventRow>(
                    r#"
                    SELECT e.commit_sequence, e.id, e.aggregate_type, e.aggregate_id,
                           e.event_type, e.payload_encrypted, e.keyring_update, e.version,
                           e.occurred_at, e.actor_id, e.causation_id, e.correlation_id,
                           e.epoch, m.global_seq AS global_sequence
                    FROM events e
                    LEFT JOIN sync_event_map m ON m.event_id = e.id
                    WHERE (?1 IS NULL OR e.aggregate_type = ?1)
                      AND (
                          (m.global_seq IS NOT NULL AND m.global_seq > ?2)
                          OR (m.global_seq IS NULL AND e.commit_sequence > ?3)
                      )
                    ORDER BY (m.global_seq IS NULL) ASC, m.global_seq ASC, e.commit_sequence ASC
                    LIMIT ?4
                    "#,
                )
                .bind(self.aggregate_type.map(|t| t.as_str()))
                .bind(meta.cursor.global_sequence)
                .bind(meta.cursor.pending_commit_sequence)
                .bind(self.batch_size)
                .fetch_all(self.db.pool())
                .await?
            }
        };

        Ok(rows)
    }

    /// Background loop: catch up on table changes, rebuild on rebase.
    pub fn start(self: Arc<Self>, mut rebase_rx: broadcast::Receiver<()>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut subscription = self
                .db
                .subscribe_to_tables(&[TABLE_EVENTS, TABLE_SYNC_EVENT_MAP]);

            self.coalesced_catch_up().await;

            loop {
                tokio::select! {
                    _ = subscription.changed() => {
                        self.coalesced_catch_up().await;
                    }
                    result = rebase_rx.recv() => {
                        match result {
                            Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                                if let Err(e) = self.rebuild().await {
                                    tracing::error!(
                                        projection_id = %self.projection_id,
                                        error = %e,
                                        "Projection rebuild failed"
                                    );
                                }
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
        })
    }

    async fn coalesced_catch_up(self: &Arc<Self>) {
        let this = self.clone();
        self.runner
            .run(|| {
                let this = this.clone();
                async move {
                    if let Err(e) = this.catch_up().await {
                        tracing::error!(
                            projection_id = %this.projection_id,
                            error = %e,
                            "Projection catch-up failed"
                        );
                    }
                }
            })
            .await;
    }
}
