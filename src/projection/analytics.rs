//! Analytics projector
//!
//! Maintains monthly totals and category rollups for active goals as
//! sparse maps, persisted as a single encrypted blob under the
//! projector's own key.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::codec::aad;
use crate::domain::{Aggregate, Goal};

use super::{
    EffectiveCursor, EventDecoder, ProjectionCacheRecord, ProjectionCacheStore, ProjectionError,
    ProjectionEventRow, ProjectionOrdering, ProjectionProcessor,
};

/// Scope key for the single rollup blob.
const ROLLUP_SCOPE: &str = "rollups";

/// Sparse rollups over active goals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsState {
    /// Active goal count per target month (`YYYY-MM`)
    pub monthly_totals: BTreeMap<String, i64>,

    /// Active goal count per category
    pub category_totals: BTreeMap<String, i64>,

    /// Achieved active goal count per target month
    pub monthly_achieved: BTreeMap<String, i64>,

    /// Monotonic blob version, bound into the AAD
    pub blob_version: i64,
}

impl AnalyticsState {
    fn bump(map: &mut BTreeMap<String, i64>, key: &str, delta: i64) {
        let entry = map.entry(key.to_string()).or_insert(0);
        *entry += delta;
        if *entry == 0 {
            map.remove(key);
        }
    }
}

/// The analytics slice of one goal: its rollup keys while active.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Slice {
    category: String,
    target_month: String,
    achieved: bool,
}

fn slice_of(goal: &Goal) -> Option<Slice> {
    if goal.version() == 0 || goal.is_archived() {
        return None;
    }
    Some(Slice {
        category: goal.category().to_string(),
        target_month: goal.target_month().to_string(),
        achieved: goal.is_achieved(),
    })
}

/// Analytics projector over the goal stream.
pub struct AnalyticsProjector {
    projection_id: String,
    ordering: ProjectionOrdering,
    decoder: EventDecoder,
    cache: ProjectionCacheStore,
    goals: HashMap<String, Goal>,
    state: AnalyticsState,
    dirty: bool,
}

impl AnalyticsProjector {
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
            goals: HashMap::new(),
            state: AnalyticsState::default(),
            dirty: false,
        }
    }

    pub fn state(&self) -> &AnalyticsState {
        &self.state
    }

    fn apply_transition(&mut self, previous: Option<Slice>, next: Option<Slice>) {
        if previous == next {
            return;
        }

        if let Some(prev) = previous {
            AnalyticsState::bump(&mut self.state.monthly_totals, &prev.target_month, -1);
            AnalyticsState::bump(&mut self.state.category_totals, &prev.category, -1);
            if prev.achieved {
                AnalyticsState::bump(&mut self.state.monthly_achieved, &prev.target_month, -1);
            }
        }

        if let Some(next) = next {
            AnalyticsState::bump(&mut self.state.monthly_totals, &next.target_month, 1);
            AnalyticsState::bump(&mut self.state.category_totals, &next.category, 1);
            if next.achieved {
                AnalyticsState::bump(&mut self.state.monthly_achieved, &next.target_month, 1);
            }
        }

        self.dirty = true;
    }

    async fn persist(&mut self, cursor: EffectiveCursor) -> Result<(), ProjectionError> {
        if !self.dirty {
            return Ok(());
        }

        self.state.blob_version += 1;
        let key = self
            .decoder
            .keyring()
            .ensure_aggregate_key(&self.projection_id)
            .await?
            .key;

        let plaintext =
            serde_json::to_vec(&self.state).map_err(crate::codec::CodecError::Serialization)?;
        let ciphertext = self.decoder.crypto().encrypt(
            &plaintext,
            &key,
            &aad::projection_cache(
                &self.projection_id,
                ROLLUP_SCOPE,
                self.state.blob_version,
                cursor.global_sequence,
                cursor.pending_commit_sequence,
            ),
        )?;

        self.cache
            .put(&ProjectionCacheRecord {
                projection_id: self.projection_id.clone(),
                scope_key: ROLLUP_SCOPE.to_string(),
                cache_version: self.state.blob_version,
                cache_encrypted: ciphertext,
                ordering: self.ordering,
                cursor,
                last_commit_sequence: cursor.pending_commit_sequence,
                written_at: Utc::now(),
            })
            .await?;

        self.dirty = false;
        Ok(())
    }
}

#[async_trait]
impl ProjectionProcessor for AnalyticsProjector {
    fn projection_id(&self) -> &str {
        &self.projection_id
    }

    async fn apply_event(
        &mut self,
        event: &ProjectionEventRow,
        _cursor_after: EffectiveCursor,
        _last_commit_sequence: i64,
    ) -> Result<(), ProjectionError> {
        let Some(typed) = self.decoder.decode(event).await? else {
            return Ok(());
        };

        let previous_state = self.goals.remove(&event.aggregate_id).unwrap_or_default();
        let previous = slice_of(&previous_state);
        let next_state = previous_state.apply(typed);
        let next = slice_of(&next_state);

        self.apply_transition(previous, next);
        self.goals.insert(event.aggregate_id.clone(), next_state);

        Ok(())
    }

    async fn on_batch_complete(&mut self, cursor: EffectiveCursor) -> Result<(), ProjectionError> {
        self.persist(cursor).await
    }

    async fn reset(&mut self) -> Result<(), ProjectionError> {
        self.goals.clear();
        self.state = AnalyticsState::default();
        self.dirty = false;
        self.cache.delete(&self.projection_id, ROLLUP_SCOPE).await?;
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

    async fn projector() -> AnalyticsProjector {
        let db = LocalDb::connect("sqlite::memory:").await.unwrap();
        let crypto: Arc<dyn CryptoService> = Arc::new(ChaChaBoxCrypto::new());
        let master_key = crypto.generate_key();
        let key_store = Arc::new(SqliteKeyStore::new(
            db.pool().clone(),
            crypto.clone(),
            master_key.clone(),
        ));
        let keyring = Arc::new(KeyringManager::new(key_store, crypto.clone(), master_key));
        let decoder = EventDecoder::new(crypto, keyring, Arc::new(UpcasterRegistry::new()));

        AnalyticsProjector::new(
            "goal-analytics",
            ProjectionOrdering::CommitSequence,
            decoder,
            ProjectionCacheStore::new(db),
        )
    }

    fn slice(category: &str, month: &str, achieved: bool) -> Option<Slice> {
        Some(Slice {
            category: category.to_string(),
            target_month: month.to_string(),
            achieved,
        })
    }

    #[tokio::test]
    async fn test_created_goal_counts_once() {
        let mut projector = projector().await;
        projector.apply_transition(None, slice("health", "2026-10", false));

        assert_eq!(projector.state().monthly_totals.get("2026-10"), Some(&1));
        assert_eq!(projector.state().category_totals.get("health"), Some(&1));
        assert!(projector.state().monthly_achieved.is_empty());
    }

    #[tokio::test]
    async fn test_reschedule_moves_between_months() {
        let mut projector = projector().await;
        projector.apply_transition(None, slice("health", "2026-10", false));
        projector.apply_transition(
            slice("health", "2026-10", false),
            slice("health", "2026-11", false),
        );

        // Sparse: the old month key disappears entirely.
        assert!(projector.state().monthly_totals.get("2026-10").is_none());
        assert_eq!(projector.state().monthly_totals.get("2026-11"), Some(&1));
        assert_eq!(projector.state().category_totals.get("health"), Some(&1));
    }

    #[tokio::test]
    async fn test_archive_removes_from_rollups() {
        let mut projector = projector().await;
        projector.apply_transition(None, slice("health", "2026-10", true));
        projector.apply_transition(slice("health", "2026-10", true), None);

        assert!(projector.state().monthly_totals.is_empty());
        assert!(projector.state().category_totals.is_empty());
        assert!(projector.state().monthly_achieved.is_empty());
    }

    #[tokio::test]
    async fn test_achieved_tracked_separately() {
        let mut projector = projector().await;
        projector.apply_transition(None, slice("health", "2026-10", false));
        projector.apply_transition(
            slice("health", "2026-10", false),
            slice("health", "2026-10", true),
        );

        assert_eq!(projector.state().monthly_totals.get("2026-10"), Some(&1));
        assert_eq!(projector.state().monthly_achieved.get("2026-10"), Some(&1));
    }

    #[tokio::test]
    async fn test_identical_transition_is_a_no_op() {
        let mut projector = projector().await;
        projector.apply_transition(None, slice("health", "2026-10", false));
        projector.dirty = false;

        projector.apply_transition(
            slice("health", "2026-10", false),
            slice("health", "2026-10", false),
        );
        assert!(!projector.dirty);
    }
}
