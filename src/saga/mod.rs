//! Goal-achievement saga
//!
//! Process manager over the goal and project streams: tracks which projects
//! are linked to and completed for each goal, and dispatches
//! `AchieveGoal` / `UnachieveGoal` commands with idempotency keys when the
//! linked set flips between fully-completed and not.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::codec::aad;
use crate::domain::{GoalEvent, ProjectEvent, ProjectStatus};
use crate::handlers::CommandDispatcher;
use crate::projection::{
    EffectiveCursor, EventDecoder, ProjectionCacheRecord, ProjectionCacheStore, ProjectionError,
    ProjectionEventRow, ProjectionOrdering, ProjectionProcessor, ProjectionRuntime,
};

/// Projection id of the process manager.
pub const GOAL_ACHIEVEMENT_PM_ID: &str = "pm.goal-achievement";

/// Per-goal process-manager state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalPmState {
    pub goal_id: String,
    pub linked_project_ids: Vec<String>,
    pub completed_project_ids: Vec<String>,
    pub achieved: bool,
    pub archived: bool,
    pub achievement_requested: bool,
    /// Aggregate version of the goal stream
    pub version: i64,
    /// Last goal-stream event observed, used for reconciliation keys
    pub last_event_id: String,
    /// Monotonic row revision, bound into the AAD
    pub revision: i64,
}

impl GoalPmState {
    fn all_linked_completed(&self) -> bool {
        !self.linked_project_ids.is_empty()
            && self
                .linked_project_ids
                .iter()
                .all(|id| self.completed_project_ids.contains(id))
    }

    fn link(&mut self, project_id: &str) {
        if !self.linked_project_ids.iter().any(|id| id == project_id) {
            self.linked_project_ids.push(project_id.to_string());
        }
    }

    fn unlink(&mut self, project_id: &str) {
        self.linked_project_ids.retain(|id| id != project_id);
        self.completed_project_ids.retain(|id| id != project_id);
    }

    fn mark_completed(&mut self, project_id: &str, completed: bool) {
        if completed {
            if !self.completed_project_ids.iter().any(|id| id == project_id) {
                self.completed_project_ids.push(project_id.to_string());
            }
        } else {
            self.completed_project_ids.retain(|id| id != project_id);
        }
    }
}

/// Per-project process-manager state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectPmState {
    pub project_id: String,
    pub goal_id: Option<String>,
    pub status: Option<ProjectStatus>,
    /// Highest project-stream version applied; redelivered events at or
    /// below it are skipped
    pub version: i64,
    pub revision: i64,
}

/// One persisted process-manager row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum PmRecord {
    Goal(GoalPmState),
    Project(ProjectPmState),
}

/// Encrypted storage for process-manager rows, kept in `projection_cache`
/// under the process manager's own key.
pub struct ProcessManagerStore {
    pm_id: String,
    decoder: EventDecoder,
    cache: ProjectionCacheStore,
    ordering: ProjectionOrdering,
}

impl ProcessManagerStore {
    pub fn new(
        pm_id: impl Into<String>,
        decoder: EventDecoder,
        cache: ProjectionCacheStore,
        ordering: ProjectionOrdering,
    ) -> Self {
        Self {
            pm_id: pm_id.into(),
            decoder,
            cache,
            ordering,
        }
    }

    async fn save(
        &self,
        scope_key: &str,
        record: &PmRecord,
        revision: i64,
        cursor: EffectiveCursor,
    ) -> Result<(), ProjectionError> {
        let key = self
            .decoder
            .keyring()
            .ensure_aggregate_key(&self.pm_id)
            .await?
            .key;

        let plaintext =
            serde_json::to_vec(record).map_err(crate::codec::CodecError::Serialization)?;
        let ciphertext = self.decoder.crypto().encrypt(
            &plaintext,
            &key,
            &aad::process_manager(
                &self.pm_id,
                scope_key,
                revision,
                cursor.global_sequence,
                cursor.pending_commit_sequence,
            ),
        )?;

        self.cache
            .put(&ProjectionCacheRecord {
                projection_id: self.pm_id.clone(),
                scope_key: scope_key.to_string(),
                cache_version: revision,
                cache_encrypted: ciphertext,
                ordering: self.ordering,
                cursor,
                last_commit_sequence: cursor.pending_commit_sequence,
                written_at: Utc::now(),
            })
            .await
    }

    /// Load every persisted row; undecryptable rows are dropped (they will
    /// be rebuilt from the log).
    async fn load_all(
        &self,
    ) -> Result<(HashMap<String, GoalPmState>, HashMap<String, ProjectPmState>), ProjectionError>
    {
        let mut goals = HashMap::new();
        let mut projects = HashMap::new();

        let key = match self
            .decoder
            .keyring()
            .resolve_key_for_event(&self.pm_id, None, None)
            .await
        {
            Ok(key) => key,
            Err(crate::crypto::CryptoError::MissingKey { .. }) => {
                return Ok((goals, projects));
            }
            Err(e) => return Err(e.into()),
        };

        for row in self.cache.list(&self.pm_id).await? {
            let plaintext = match self.decoder.crypto().decrypt(
                &row.cache_encrypted,
                &key,
                &aad::process_manager(
                    &self.pm_id,
                    &row.scope_key,
                    row.cache_version,
                    row.cursor.global_sequence,
                    row.cursor.pending_commit_sequence,
                ),
            ) {
                Ok(bytes) => bytes,
                Err(e) if e.is_auth_failure() => {
                    tracing::warn!(
                        scope_key = %row.scope_key,
                        "Process-manager row failed authentication; dropping"
                    );
                    self.cache.delete(&self.pm_id, &row.scope_key).await?;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            match serde_json::from_slice::<PmRecord>(&plaintext)
                .map_err(crate::codec::CodecError::Serialization)?
            {
                PmRecord::Goal(state) => {
                    goals.insert(state.goal_id.clone(), state);
                }
                PmRecord::Project(state) => {
                    projects.insert(state.project_id.clone(), state);
                }
            }
        }

        Ok((goals, projects))
    }

    async fn purge(&self) -> Result<u64, ProjectionError> {
        self.cache.purge(&self.pm_id).await
    }
}

/// The goal-achievement process manager.
pub struct GoalAchievementSaga {
    decoder: EventDecoder,
    store: ProcessManagerStore,
    dispatcher: Arc<dyn CommandDispatcher>,
    goals: HashMap<String, GoalPmState>,
    projects: HashMap<String, ProjectPmState>,
    replaying: bool,
}

impl GoalAchievementSaga {
    pub fn new(
        decoder: EventDecoder,
        store: ProcessManagerStore,
        dispatcher: Arc<dyn CommandDispatcher>,
    ) -> Self {
        Self {
            decoder,
            store,
            dispatcher,
            goals: HashMap::new(),
            projects: HashMap::new(),
            replaying: true,
        }
    }

    /// Load persisted process-manager state and enter replay mode.
    ///
    /// Call before the first catch-up; no commands are dispatched until
    /// [`finish_bootstrap`](Self::finish_bootstrap) runs.
    pub async fn bootstrap(&mut self) -> Result<(), ProjectionError> {
        let (goals, projects) = self.store.load_all().await?;
        self.goals = goals;
        self.projects = projects;
        self.replaying = true;
        Ok(())
    }

    /// Reconciliation pass after bootstrap: one forced evaluation per seen
    /// goal, then live dispatching begins.
    pub async fn finish_bootstrap(
        &mut self,
        cursor: EffectiveCursor,
    ) -> Result<(), ProjectionError> {
        let goal_ids: Vec<String> = self.goals.keys().cloned().collect();
        for goal_id in goal_ids {
            let event_id = self
                .goals
                .get(&goal_id)
                .map(|g| g.last_event_id.clone())
                .unwrap_or_default();
            self.evaluate(&goal_id, &event_id, true, cursor).await?;
        }
        self.replaying = false;
        Ok(())
    }

    pub fn is_replaying(&self) -> bool {
        self.replaying
    }

    pub fn goal_state(&self, goal_id: &str) -> Option<&GoalPmState> {
        self.goals.get(goal_id)
    }

    fn goal_entry(&mut self, goal_id: &str) -> &mut GoalPmState {
        self.goals
            .entry(goal_id.to_string())
            .or_insert_with(|| GoalPmState {
                goal_id: goal_id.to_string(),
                ..GoalPmState::default()
            })
    }

    fn project_entry(&mut self, project_id: &str) -> &mut ProjectPmState {
        self.projects
            .entry(project_id.to_string())
            .or_insert_with(|| ProjectPmState {
                project_id: project_id.to_string(),
                ..ProjectPmState::default()
            })
    }

    async fn persist_goal(
        &mut self,
        goal_id: &str,
        cursor: EffectiveCursor,
    ) -> Result<(), ProjectionError> {
        if let Some(state) = self.goals.get_mut(goal_id) {
            state.revision += 1;
            let record = PmRecord::Goal(state.clone());
            let revision = state.revision;
            self.store
                .save(&format!("goal:{}", goal_id), &record, revision, cursor)
                .await?;
        }
        Ok(())
    }

    async fn persist_project(
        &mut self,
        project_id: &str,
        cursor: EffectiveCursor,
    ) -> Result<(), ProjectionError> {
        if let Some(state) = self.projects.get_mut(project_id) {
            state.revision += 1;
            let record = PmRecord::Project(state.clone());
            let revision = state.revision;
            self.store
                .save(&format!("project:{}", project_id), &record, revision, cursor)
                .await?;
        }
        Ok(())
    }

    /// Apply a goal-stream event. Returns the goal to evaluate, or `None`
    /// for a redelivered event the state has already absorbed.
    fn apply_goal_event(
        &mut self,
        event: &GoalEvent,
        version: i64,
        event_id: &str,
    ) -> Option<String> {
        let goal_id = event.goal_id().to_string();
        let state = self.goal_entry(&goal_id);
        if version <= state.version {
            return None;
        }
        state.version = version;
        state.last_event_id = event_id.to_string();

        match event {
            GoalEvent::GoalAchieved { .. } => {
                state.achieved = true;
            }
            GoalEvent::GoalUnachieved { .. } => {
                state.achieved = false;
            }
            GoalEvent::GoalArchived { .. } => {
                state.archived = true;
                state.achievement_requested = false;
            }
            _ => {}
        }

        Some(goal_id)
    }

    /// Apply a project-stream event.
    ///
    /// `None` means the event was redelivered and skipped; otherwise the
    /// inner option names the goal whose linked or completed sets changed.
    fn apply_project_event(
        &mut self,
        event: &ProjectEvent,
        version: i64,
    ) -> Option<Option<String>> {
        {
            let project = self.project_entry(event.project_id());
            if version <= project.version {
                return None;
            }
            project.version = version;
        }

        Some(self.project_transition(event))
    }

    fn project_transition(&mut self, event: &ProjectEvent) -> Option<String> {
        match event {
            ProjectEvent::ProjectCreated {
                project_id,
                goal_id,
                status,
                ..
            } => {
                let project = self.project_entry(project_id);
                project.goal_id = goal_id.clone();
                project.status = Some(*status);

                if let Some(goal_id) = goal_id {
                    let completed = *status == ProjectStatus::Completed;
                    let goal_id = goal_id.clone();
                    let state = self.goal_entry(&goal_id);
                    state.link(project_id);
                    state.mark_completed(project_id, completed);
                    return Some(goal_id);
                }
                None
            }

            ProjectEvent::ProjectGoalAdded {
                project_id,
                goal_id,
            } => {
                let previous = {
                    let project = self.project_entry(project_id);
                    let previous = project.goal_id.take();
                    project.goal_id = Some(goal_id.clone());
                    previous
                };

                if let Some(previous_goal) = previous {
                    self.goal_entry(&previous_goal).unlink(project_id);
                }

                let completed = self
                    .projects
                    .get(project_id)
                    .map(|p| p.status == Some(ProjectStatus::Completed))
                    .unwrap_or(false);
                let state = self.goal_entry(goal_id);
                state.link(project_id);
                state.mark_completed(project_id, completed);
                Some(goal_id.clone())
            }

            ProjectEvent::ProjectGoalRemoved {
                project_id,
                goal_id,
            } => {
                self.project_entry(project_id).goal_id = None;
                self.goal_entry(goal_id).unlink(project_id);
                Some(goal_id.clone())
            }

            ProjectEvent::ProjectStatusTransitioned { project_id, to, .. } => {
                let goal_id = {
                    let project = self.project_entry(project_id);
                    project.status = Some(*to);
                    project.goal_id.clone()
                };

                if let Some(goal_id) = goal_id {
                    self.goal_entry(&goal_id)
                        .mark_completed(project_id, *to == ProjectStatus::Completed);
                    return Some(goal_id);
                }
                None
            }

            ProjectEvent::ProjectRenamed { .. } | ProjectEvent::ProjectArchived { .. } => None,
        }
    }

    /// Evaluate the achieve/unachieve rules for one goal and dispatch.
    async fn evaluate(
        &mut self,
        goal_id: &str,
        event_id: &str,
        force_retry: bool,
        cursor: EffectiveCursor,
    ) -> Result<(), ProjectionError> {
        let Some(state) = self.goals.get(goal_id) else {
            return Ok(());
        };

        let achievable = !state.achieved
            && !state.archived
            && state.all_linked_completed()
            && state.version > 0
            && (!state.achievement_requested || force_retry);

        let unachievable = (state.achieved || state.achievement_requested)
            && !state.archived
            && !state.linked_project_ids.is_empty()
            && !state.all_linked_completed()
            && state.version > 0;

        if achievable {
            let known_version = state.version;
            let key = format!("goal-achieve:{}:{}", goal_id, event_id);

            self.goal_entry(goal_id).achievement_requested = true;
            self.persist_goal(goal_id, cursor).await?;

            tracing::info!(goal_id = %goal_id, "All linked projects completed; requesting achievement");
            if let Err(e) = self
                .dispatcher
                .achieve_goal(goal_id, known_version, &key)
                .await
            {
                self.goal_entry(goal_id).achievement_requested = false;
                self.persist_goal(goal_id, cursor).await?;
                return Err(ProjectionError::Processor(format!(
                    "AchieveGoal dispatch failed: {}",
                    e
                )));
            }
        } else if unachievable {
            let known_version = state.version;
            let key = format!("goal-unachieve:{}:{}", goal_id, known_version);

            tracing::info!(goal_id = %goal_id, "Linked projects reopened; requesting unachievement");
            self.dispatcher
                .unachieve_goal(goal_id, known_version, &key)
                .await
                .map_err(|e| {
                    ProjectionError::Processor(format!("UnachieveGoal dispatch failed: {}", e))
                })?;

            if self.goals.get(goal_id).map(|s| s.achievement_requested) == Some(true) {
                self.goal_entry(goal_id).achievement_requested = false;
                self.persist_goal(goal_id, cursor).await?;
            }
        }

        Ok(())
    }
}

/// Bring a saga runtime fully online: load persisted state, replay to the
/// head without dispatching, then reconcile once per seen goal.
pub async fn bootstrap_runtime(
    runtime: &ProjectionRuntime<GoalAchievementSaga>,
) -> Result<(), ProjectionError> {
    runtime.processor().await.bootstrap().await?;
    runtime.catch_up().await?;
    let cursor = runtime.meta().await?.cursor;
    runtime.processor().await.finish_bootstrap(cursor).await
}

/// Rebase handling: wipe process-manager state, replay from zero, then
/// reconcile. Use instead of a bare rebuild, which would leave the saga in
/// replay mode.
pub async fn rebuild_runtime(
    runtime: &ProjectionRuntime<GoalAchievementSaga>,
) -> Result<(), ProjectionError> {
    runtime.rebuild().await?;
    let cursor = runtime.meta().await?.cursor;
    runtime.processor().await.finish_bootstrap(cursor).await
}

#[async_trait]
impl ProjectionProcessor for GoalAchievementSaga {
    fn projection_id(&self) -> &str {
        GOAL_ACHIEVEMENT_PM_ID
    }

    async fn apply_event(
        &mut self,
        event: &ProjectionEventRow,
        cursor_after: EffectiveCursor,
        _last_commit_sequence: i64,
    ) -> Result<(), ProjectionError> {
        let affected_goal = match event.aggregate_type.as_str() {
            "goal" => match self.decoder.decode::<GoalEvent>(event).await? {
                Some(typed) => {
                    let goal_id = self.apply_goal_event(&typed, event.version, &event.id);
                    if let Some(goal_id) = &goal_id {
                        self.persist_goal(goal_id, cursor_after).await?;
                    }
                    goal_id
                }
                None => None,
            },
            "project" => match self.decoder.decode::<ProjectEvent>(event).await? {
                Some(typed) => match self.apply_project_event(&typed, event.version) {
                    Some(affected) => {
                        self.persist_project(typed.project_id(), cursor_after).await?;
                        if let Some(goal_id) = &affected {
                            self.persist_goal(goal_id, cursor_after).await?;
                        }
                        affected
                    }
                    None => None,
                },
                None => None,
            },
            _ => None,
        };

        if self.replaying {
            return Ok(());
        }

        if let Some(goal_id) = affected_goal {
            self.evaluate(&goal_id, &event.id, false, cursor_after).await?;
        }

        Ok(())
    }

    async fn reset(&mut self) -> Result<(), ProjectionError> {
        self.goals.clear();
        self.projects.clear();
        self.replaying = true;
        let wiped = self.store.purge().await?;
        tracing::info!(wiped = wiped, "Process-manager state reset");
        Ok(())
    }
}
