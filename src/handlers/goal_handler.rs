//! Goal command handler
//!
//! Validates goal commands, records idempotency keys, and drives the goal
//! repository. Implements the dispatch port used by the achievement saga.

use async_trait::async_trait;

use crate::domain::Goal;
use crate::error::AppError;
use crate::event_store::{IdempotencyOutcome, IdempotencyStore, Repository, StoredEventRow};

use super::{CommandDispatcher, CommandMeta, CommandOutcome, CreateGoalCommand};

/// Handler for goal commands
pub struct GoalCommandHandler {
    repository: Repository<Goal>,
    idempotency: IdempotencyStore,
}

impl GoalCommandHandler {
    pub fn new(repository: Repository<Goal>, idempotency: IdempotencyStore) -> Self {
        Self {
            repository,
            idempotency,
        }
    }

    /// Execute `CreateGoal`.
    pub async fn create(
        &self,
        command: CreateGoalCommand,
        meta: CommandMeta,
    ) -> Result<CommandOutcome, AppError> {
        validate_id("goal_id", &command.goal_id)?;
        validate_title(&command.title)?;
        validate_category(&command.category)?;
        validate_month(&command.target_month)?;

        if let Some(outcome) = self
            .reserve_key(&meta, "CreateGoal", &command.goal_id)
            .await?
        {
            return Ok(outcome);
        }

        if self.repository.load(&command.goal_id).await?.is_some() {
            return Err(AppError::validation("goal_id", "goal already exists"));
        }

        let (_, event) = Goal::create(
            &command.goal_id,
            &command.title,
            &command.category,
            &command.target_month,
        );

        let (state, rows) = self
            .repository
            .save(Goal::default(), vec![event], meta.known_version, &meta.context)
            .await?;

        Ok(applied(&state, rows))
    }

    /// Execute `RenameGoal`.
    pub async fn rename(
        &self,
        goal_id: &str,
        title: &str,
        meta: CommandMeta,
    ) -> Result<CommandOutcome, AppError> {
        validate_title(title)?;
        if let Some(outcome) = self.reserve_key(&meta, "RenameGoal", goal_id).await? {
            return Ok(outcome);
        }

        let goal = self.load_existing(goal_id).await?;
        let event = goal.rename(title)?;
        let (state, rows) = self
            .repository
            .save(goal, vec![event], meta.known_version, &meta.context)
            .await?;
        Ok(applied(&state, rows))
    }

    /// Execute `RescheduleGoal`.
    pub async fn reschedule(
        &self,
        goal_id: &str,
        target_month: &str,
        meta: CommandMeta,
    ) -> Result<CommandOutcome, AppError> {
        validate_month(target_month)?;
        if let Some(outcome) = self.reserve_key(&meta, "RescheduleGoal", goal_id).await? {
            return Ok(outcome);
        }

        let goal = self.load_existing(goal_id).await?;
        let event = goal.reschedule(target_month)?;
        let (state, rows) = self
            .repository
            .save(goal, vec![event], meta.known_version, &meta.context)
            .await?;
        Ok(applied(&state, rows))
    }

    /// Execute `RecategorizeGoal`.
    pub async fn recategorize(
        &self,
        goal_id: &str,
        category: &str,
        meta: CommandMeta,
    ) -> Result<CommandOutcome, AppError> {
        validate_category(category)?;
        if let Some(outcome) = self.reserve_key(&meta, "RecategorizeGoal", goal_id).await? {
            return Ok(outcome);
        }

        let goal = self.load_existing(goal_id).await?;
        let event = goal.recategorize(category)?;
        let (state, rows) = self
            .repository
            .save(goal, vec![event], meta.known_version, &meta.context)
            .await?;
        Ok(applied(&state, rows))
    }

    /// Execute `AchieveGoal`.
    pub async fn achieve(
        &self,
        goal_id: &str,
        meta: CommandMeta,
    ) -> Result<CommandOutcome, AppError> {
        if let Some(outcome) = self.reserve_key(&meta, "AchieveGoal", goal_id).await? {
            return Ok(outcome);
        }

        let goal = self.load_existing(goal_id).await?;
        let event = goal.achieve()?;
        let (state, rows) = self
            .repository
            .save(goal, vec![event], meta.known_version, &meta.context)
            .await?;
        Ok(applied(&state, rows))
    }

    /// Execute `UnachieveGoal`.
    pub async fn unachieve(
        &self,
        goal_id: &str,
        meta: CommandMeta,
    ) -> Result<CommandOutcome, AppError> {
        if let Some(outcome) = self.reserve_key(&meta, "UnachieveGoal", goal_id).await? {
            return Ok(outcome);
        }

        let goal = self.load_existing(goal_id).await?;
        let event = goal.unachieve()?;
        let (state, rows) = self
            .repository
            .save(goal, vec![event], meta.known_version, &meta.context)
            .await?;
        Ok(applied(&state, rows))
    }

    /// Execute `ArchiveGoal`.
    pub async fn archive(
        &self,
        goal_id: &str,
        meta: CommandMeta,
    ) -> Result<CommandOutcome, AppError> {
        if let Some(outcome) = self.reserve_key(&meta, "ArchiveGoal", goal_id).await? {
            return Ok(outcome);
        }

        let goal = self.load_existing(goal_id).await?;
        let event = goal.archive()?;
        let (state, rows) = self
            .repository
            .save(goal, vec![event], meta.known_version, &meta.context)
            .await?;
        Ok(applied(&state, rows))
    }

    async fn load_existing(&self, goal_id: &str) -> Result<Goal, AppError> {
        self.repository
            .load(goal_id)
            .await?
            .ok_or_else(|| AppError::validation("goal_id", format!("goal not found: {}", goal_id)))
    }

    /// Record the idempotency key, short-circuiting replays.
    async fn reserve_key(
        &self,
        meta: &CommandMeta,
        command_type: &str,
        aggregate_id: &str,
    ) -> Result<Option<CommandOutcome>, AppError> {
        let Some(key) = meta.idempotency_key.as_deref() else {
            return Ok(None);
        };

        match self.idempotency.record(key, command_type, aggregate_id).await? {
            IdempotencyOutcome::Recorded => Ok(None),
            IdempotencyOutcome::AlreadyRecorded => {
                tracing::debug!(key = %key, "Idempotent replay; skipping command");
                Ok(Some(CommandOutcome::AlreadyApplied {
                    aggregate_id: aggregate_id.to_string(),
                }))
            }
        }
    }
}

#[async_trait]
impl CommandDispatcher for GoalCommandHandler {
    async fn achieve_goal(
        &self,
        goal_id: &str,
        known_version: i64,
        idempotency_key: &str,
    ) -> Result<(), AppError> {
        let meta = CommandMeta::new()
            .with_known_version(known_version)
            .with_idempotency_key(idempotency_key);
        self.achieve(goal_id, meta).await.map(|_| ())
    }

    async fn unachieve_goal(
        &self,
        goal_id: &str,
        known_version: i64,
        idempotency_key: &str,
    ) -> Result<(), AppError> {
        let meta = CommandMeta::new()
            .with_known_version(known_version)
            .with_idempotency_key(idempotency_key);
        self.unachieve(goal_id, meta).await.map(|_| ())
    }
}

fn applied(state: &Goal, rows: Vec<StoredEventRow>) -> CommandOutcome {
    use crate::domain::Aggregate;
    CommandOutcome::Applied {
        aggregate_id: state.id().to_string(),
        version: state.version(),
        commit_sequences: rows.into_iter().map(|r| r.commit_sequence).collect(),
    }
}

pub(super) fn validate_id(field: &'static str, value: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::validation(field, "must not be empty"));
    }
    Ok(())
}

pub(super) fn validate_title(title: &str) -> Result<(), AppError> {
    if title.trim().is_empty() {
        return Err(AppError::validation("title", "must not be empty"));
    }
    if title.len() > 200 {
        return Err(AppError::validation("title", "must be at most 200 characters"));
    }
    Ok(())
}

fn validate_category(category: &str) -> Result<(), AppError> {
    if category.trim().is_empty() {
        return Err(AppError::validation("category", "must not be empty"));
    }
    Ok(())
}

fn validate_month(month: &str) -> Result<(), AppError> {
    let valid = month.len() == 7
        && month.as_bytes()[4] == b'-'
        && month[..4].chars().all(|c| c.is_ascii_digit())
        && month[5..].chars().all(|c| c.is_ascii_digit())
        && matches!(month[5..].parse::<u32>(), Ok(1..=12));

    if !valid {
        return Err(AppError::validation(
            "target_month",
            "must be formatted as YYYY-MM",
        ));
    }
    Ok(())
}
