//! Search projector
//!
//! Maintains an inverted-text index over list-item documents, persisted as
//! a single encrypted artifact. Supports prefix and bounded-fuzzy matching;
//! results are sorted deterministically by creation time, newest first.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::aad;
use crate::crypto::CryptoError;
use crate::domain::{Aggregate, HasListItem, ProjectStatus};
use crate::domain::{GoalListItem, ProjectListItem};

use super::{
    EffectiveCursor, EventDecoder, IndexArtifactRecord, IndexArtifactStore, ProjectionError,
    ProjectionEventRow, ProjectionProcessor,
};

/// Scope key for the single artifact each search projector owns.
const ARTIFACT_SCOPE: &str = "all";

/// Search tuning per document corpus.
#[derive(Debug, Clone, Copy)]
pub struct SearchOptions {
    /// Treat query tokens as prefixes
    pub prefix: bool,
    /// Maximum edit distance as a fraction of the token length
    pub fuzzy: f64,
}

impl SearchOptions {
    pub fn goals() -> Self {
        Self {
            prefix: true,
            fuzzy: 0.3,
        }
    }

    pub fn projects() -> Self {
        Self {
            prefix: true,
            fuzzy: 0.2,
        }
    }
}

/// A query against the index.
#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub term: String,
}

impl SearchQuery {
    pub fn new(term: impl Into<String>) -> Self {
        Self { term: term.into() }
    }
}

/// Uniform searchable document over goal and project list items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchDoc {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub achieved: Option<bool>,
    pub status: Option<ProjectStatus>,
    pub goal_id: Option<String>,
}

impl From<GoalListItem> for SearchDoc {
    fn from(item: GoalListItem) -> Self {
        Self {
            id: item.id,
            title: item.title,
            created_at: item.created_at,
            achieved: Some(item.achieved),
            status: None,
            goal_id: None,
        }
    }
}

impl From<ProjectListItem> for SearchDoc {
    fn from(item: ProjectListItem) -> Self {
        Self {
            id: item.id,
            title: item.title,
            created_at: item.created_at,
            achieved: None,
            status: Some(item.status),
            goal_id: item.goal_id,
        }
    }
}

/// Build phase of the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexStatus {
    Missing,
    Building,
    Ready,
}

/// Serialized index payload.
#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexArtifact {
    artifact_version: i64,
    documents: HashMap<String, SearchDoc>,
    postings: BTreeMap<String, BTreeSet<String>>,
}

/// Search projector over one aggregate type's list items.
pub struct SearchProjector<A: Aggregate + HasListItem>
where
    A::Item: Into<SearchDoc>,
{
    index_id: String,
    options: SearchOptions,
    decoder: EventDecoder,
    artifacts: IndexArtifactStore,
    states: HashMap<String, A>,
    index: IndexArtifact,
    status: IndexStatus,
    dirty: bool,
}

impl<A: Aggregate + HasListItem> SearchProjector<A>
where
    A::Item: Into<SearchDoc>,
{
    pub fn new(
        index_id: impl Into<String>,
        options: SearchOptions,
        decoder: EventDecoder,
        artifacts: IndexArtifactStore,
    ) -> Self {
        Self {
            index_id: index_id.into(),
            options,
            decoder,
            artifacts,
            states: HashMap::new(),
            index: IndexArtifact::default(),
            status: IndexStatus::Missing,
            dirty: false,
        }
    }

    pub fn status(&self) -> IndexStatus {
        self.status
    }

    /// Ensure the index is usable, preferring the persisted artifact.
    ///
    /// An artifact that cannot be decrypted is discarded and the index is
    /// rebuilt from the current documents.
    pub async fn ensure_built(&mut self) -> Result<(), ProjectionError> {
        if self.status == IndexStatus::Ready {
            return Ok(());
        }
        self.status = IndexStatus::Building;

        if let Some(record) = self.artifacts.get(&self.index_id, ARTIFACT_SCOPE).await? {
            match self.open_artifact(&record).await {
                Ok(artifact) => {
                    self.index = artifact;
                    self.status = IndexStatus::Ready;
                    return Ok(());
                }
                Err(ProjectionError::Crypto(e)) if e.is_auth_failure() => {
                    tracing::warn!(
                        index_id = %self.index_id,
                        "Index artifact failed authentication; rebuilding"
                    );
                    self.artifacts.delete(&self.index_id, ARTIFACT_SCOPE).await?;
                }
                Err(e) => return Err(e),
            }
        }

        self.rebuild_from_documents();
        self.status = IndexStatus::Ready;
        Ok(())
    }

    async fn open_artifact(
        &self,
        record: &IndexArtifactRecord,
    ) -> Result<IndexArtifact, ProjectionError> {
        let key = self
            .decoder
            .keyring()
            .resolve_key_for_event(&self.index_id, None, None)
            .await
            .map_err(|e| match e {
                CryptoError::MissingKey { .. } => CryptoError::AeadAuthenticationFailed,
                other => other,
            })?;

        let plaintext = self.decoder.crypto().decrypt(
            &record.artifact_encrypted,
            &key,
            &aad::index_artifact(
                &self.index_id,
                ARTIFACT_SCOPE,
                record.artifact_version,
                record.cursor.global_sequence,
                record.cursor.pending_commit_sequence,
            ),
        )?;

        Ok(serde_json::from_slice(&plaintext).map_err(crate::codec::CodecError::Serialization)?)
    }

    fn rebuild_from_documents(&mut self) {
        let documents: Vec<SearchDoc> = self
            .states
            .values()
            .filter_map(|state| state.list_item().map(Into::into))
            .collect();

        self.index.documents.clear();
        self.index.postings.clear();
        for doc in documents {
            self.upsert_doc(doc);
        }
        self.dirty = true;
    }

    fn upsert_doc(&mut self, doc: SearchDoc) {
        self.remove_doc(&doc.id.clone());
        for token in tokenize(&doc.title) {
            self.index
                .postings
                .entry(token)
                .or_default()
                .insert(doc.id.clone());
        }
        self.index.documents.insert(doc.id.clone(), doc);
        self.dirty = true;
    }

    fn remove_doc(&mut self, id: &str) {
        if self.index.documents.remove(id).is_none() {
            return;
        }
        self.index.postings.retain(|_, ids| {
            ids.remove(id);
            !ids.is_empty()
        });
        self.dirty = true;
    }

    /// Flush the index artifact if anything changed since the last flush.
    pub async fn persist_index(&mut self, cursor: EffectiveCursor) -> Result<(), ProjectionError> {
        if !self.dirty {
            return Ok(());
        }

        self.index.artifact_version += 1;
        let key = self
            .decoder
            .keyring()
            .ensure_aggregate_key(&self.index_id)
            .await?
            .key;

        let plaintext =
            serde_json::to_vec(&self.index).map_err(crate::codec::CodecError::Serialization)?;
        let ciphertext = self.decoder.crypto().encrypt(
            &plaintext,
            &key,
            &aad::index_artifact(
                &self.index_id,
                ARTIFACT_SCOPE,
                self.index.artifact_version,
                cursor.global_sequence,
                cursor.pending_commit_sequence,
            ),
        )?;

        self.artifacts
            .put(&IndexArtifactRecord {
                index_id: self.index_id.clone(),
                scope_key: ARTIFACT_SCOPE.to_string(),
                artifact_version: self.index.artifact_version,
                artifact_encrypted: ciphertext,
                cursor,
                written_at: Utc::now(),
            })
            .await?;

        self.dirty = false;
        Ok(())
    }

    /// Run a query.
    ///
    /// An empty term returns every document passing the filter. Matches are
    /// sorted by `created_at` descending, ties broken by id, so results are
    /// stable across runs.
    pub fn search<F>(&self, query: &SearchQuery, filter: F) -> Vec<SearchDoc>
    where
        F: Fn(&SearchDoc) -> bool,
    {
        let term = query.term.trim();

        let mut matches: Vec<&SearchDoc> = if term.is_empty() {
            self.index.documents.values().filter(|&d| filter(d)).collect()
        } else {
            let tokens = tokenize(term);
            let mut candidate_ids: Option<BTreeSet<String>> = None;

            for token in tokens {
                let mut ids = BTreeSet::new();
                let max_distance = (token.chars().count() as f64 * self.options.fuzzy) as usize;

                for (posting, docs) in &self.index.postings {
                    let hit = posting == &token
                        || (self.options.prefix && posting.starts_with(&token))
                        || (max_distance > 0
                            && levenshtein_within(posting, &token, max_distance));
                    if hit {
                        ids.extend(docs.iter().cloned());
                    }
                }

                candidate_ids = Some(match candidate_ids {
                    None => ids,
                    Some(acc) => acc.intersection(&ids).cloned().collect(),
                });
            }

            candidate_ids
                .unwrap_or_default()
                .iter()
                .filter_map(|id| self.index.documents.get(id))
                .filter(|&d| filter(d))
                .collect()
        };

        matches.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        matches.into_iter().cloned().collect()
    }
}

#[async_trait]
impl<A> ProjectionProcessor for SearchProjector<A>
where
    A: Aggregate + HasListItem + Sync,
    A::Item: Into<SearchDoc>,
{
    fn projection_id(&self) -> &str {
        &self.index_id
    }

    async fn apply_event(
        &mut self,
        event: &ProjectionEventRow,
        _cursor_after: EffectiveCursor,
        _last_commit_sequence: i64,
    ) -> Result<(), ProjectionError> {
        self.ensure_built().await?;

        let Some(typed) = self.decoder.decode::<A::Event>(event).await? else {
            return Ok(());
        };

        let state = self
            .states
            .remove(&event.aggregate_id)
            .unwrap_or_default()
            .apply(typed);

        match state.list_item() {
            Some(item) => self.upsert_doc(item.into()),
            None => self.remove_doc(&event.aggregate_id),
        }
        self.states.insert(event.aggregate_id.clone(), state);

        Ok(())
    }

    async fn on_batch_complete(&mut self, cursor: EffectiveCursor) -> Result<(), ProjectionError> {
        self.persist_index(cursor).await
    }

    async fn reset(&mut self) -> Result<(), ProjectionError> {
        self.states.clear();
        self.index = IndexArtifact::default();
        self.status = IndexStatus::Missing;
        self.dirty = false;
        self.artifacts.delete(&self.index_id, ARTIFACT_SCOPE).await?;
        Ok(())
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

/// Bounded Levenshtein check: true when edit distance ≤ `max`.
fn levenshtein_within(a: &str, b: &str, max: usize) -> bool {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    if a.len().abs_diff(b.len()) > max {
        return false;
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];

    for (i, &ca) in a.iter().enumerate() {
        current[0] = i + 1;
        let mut row_min = current[0];
        for (j, &cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            current[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(current[j] + 1);
            row_min = row_min.min(current[j + 1]);
        }
        if row_min > max {
            return false;
        }
        std::mem::swap(&mut prev, &mut current);
    }

    prev[b.len()] <= max
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::codec::envelope::UpcasterRegistry;
    use crate::crypto::{ChaChaBoxCrypto, CryptoService, KeyringManager, SqliteKeyStore};
    use crate::db::LocalDb;
    use crate::domain::Goal;

    fn doc(id: &str, title: &str, minutes_ago: i64) -> SearchDoc {
        SearchDoc {
            id: id.to_string(),
            title: title.to_string(),
            created_at: Utc::now() - chrono::Duration::minutes(minutes_ago),
            achieved: Some(false),
            status: None,
            goal_id: None,
        }
    }

    async fn projector() -> SearchProjector<Goal> {
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

        SearchProjector::new(
            "goal-search",
            SearchOptions::goals(),
            decoder,
            IndexArtifactStore::new(db),
        )
    }

    #[tokio::test]
    async fn test_empty_term_returns_all_sorted_by_created_at_desc() {
        let mut projector = projector().await;
        projector.upsert_doc(doc("g1", "Run a marathon", 30));
        projector.upsert_doc(doc("g2", "Read ten books", 10));
        projector.upsert_doc(doc("g3", "Learn sailing", 20));

        let results = projector.search(&SearchQuery::new(""), |_| true);
        let ids: Vec<&str> = results.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["g2", "g3", "g1"]);
    }

    #[tokio::test]
    async fn test_prefix_match() {
        let mut projector = projector().await;
        projector.upsert_doc(doc("g1", "Run a marathon", 1));
        projector.upsert_doc(doc("g2", "Learn sailing", 2));

        let results = projector.search(&SearchQuery::new("mara"), |_| true);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "g1");
    }

    #[tokio::test]
    async fn test_fuzzy_match_bounded() {
        let mut projector = projector().await;
        projector.upsert_doc(doc("g1", "Run a marathon", 1));

        // One typo within 0.3 of the token length.
        let results = projector.search(&SearchQuery::new("marathom"), |_| true);
        assert_eq!(results.len(), 1);

        // Far beyond the bound.
        let results = projector.search(&SearchQuery::new("zzzzzzzz"), |_| true);
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_filter_predicate_applies() {
        let mut projector = projector().await;
        let mut achieved = doc("g1", "Run a marathon", 1);
        achieved.achieved = Some(true);
        projector.upsert_doc(achieved);
        projector.upsert_doc(doc("g2", "Run errands", 2));

        let results = projector.search(&SearchQuery::new("run"), |d| d.achieved == Some(false));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "g2");
    }

    #[tokio::test]
    async fn test_remove_doc_drops_postings() {
        let mut projector = projector().await;
        projector.upsert_doc(doc("g1", "Run a marathon", 1));
        projector.remove_doc("g1");

        let results = projector.search(&SearchQuery::new("marathon"), |_| true);
        assert!(results.is_empty());
        assert!(projector.index.postings.is_empty());
    }

    #[tokio::test]
    async fn test_persist_and_reload_artifact() {
        let mut projector = projector().await;
        projector.upsert_doc(doc("g1", "Run a marathon", 1));
        projector
            .persist_index(EffectiveCursor::new(5, 0))
            .await
            .unwrap();

        // Drop in-memory state, then reload from the artifact.
        projector.index = IndexArtifact::default();
        projector.status = IndexStatus::Missing;
        projector.ensure_built().await.unwrap();

        assert_eq!(projector.status(), IndexStatus::Ready);
        let results = projector.search(&SearchQuery::new("marathon"), |_| true);
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_levenshtein_within() {
        assert!(levenshtein_within("marathon", "marathom", 2));
        assert!(!levenshtein_within("marathon", "sailing", 2));
        assert!(levenshtein_within("abc", "abc", 0));
        assert!(!levenshtein_within("abc", "abd", 0));
    }
}
