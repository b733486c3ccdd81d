//! Project command handler
//!
//! Validates project commands and drives the project repository.

use crate::domain::{Aggregate, Project, ProjectStatus};
use crate::error::AppError;
use crate::event_store::{
    IdempotencyOutcome, IdempotencyStore, Repository, StoredEventRow,
};

use super::goal_handler::{validate_id, validate_title};
use super::{CommandMeta, CommandOutcome, CreateProjectCommand, TransitionProjectStatusCommand};

/// Handler for project commands
pub struct ProjectCommandHandler {
    repository: Repository<Project>,
    idempotency: IdempotencyStore,
}

impl ProjectCommandHandler {
    pub fn new(repository: Repository<Project>, idempotency: IdempotencyStore) -> Self {
        Self {
            repository,
            idempotency,
        }
    }

    /// Execute `CreateProject`.
    pub async fn create(
        &self,
        command: CreateProjectCommand,
        meta: CommandMeta,
    ) -> Result<CommandOutcome, AppError> {
        validate_id("project_id", &command.project_id)?;
        validate_title(&command.title)?;
        if let Some(goal_id) = &command.goal_id {
            validate_id("goal_id", goal_id)?;
        }

        if let Some(outcome) = self
            .reserve_key(&meta, "CreateProject", &command.project_id)
            .await?
        {
            return Ok(outcome);
        }

        if self.repository.load(&command.project_id).await?.is_some() {
            return Err(AppError::validation("project_id", "project already exists"));
        }

        let (_, event) = Project::create(&command.project_id, &command.title, command.goal_id);
        let (state, rows) = self
            .repository
            .save(
                Project::default(),
                vec![event],
                meta.known_version,
                &meta.context,
            )
            .await?;
        Ok(applied(&state, rows))
    }

    /// Execute `RenameProject`.
    pub async fn rename(
        &self,
        project_id: &str,
        title: &str,
        meta: CommandMeta,
    ) -> Result<CommandOutcome, AppError> {
        validate_title(title)?;
        if let Some(outcome) = self.reserve_key(&meta, "RenameProject", project_id).await? {
            return Ok(outcome);
        }

        let project = self.load_existing(project_id).await?;
        let event = project.rename(title)?;
        let (state, rows) = self
            .repository
            .save(project, vec![event], meta.known_version, &meta.context)
            .await?;
        Ok(applied(&state, rows))
    }

    /// Execute `LinkProjectToGoal`.
    pub async fn link_to_goal(
        &self,
        project_id: &str,
        goal_id: &str,
        meta: CommandMeta,
    ) -> Result<CommandOutcome, AppError> {
        validate_id("goal_id", goal_id)?;
        if let Some(outcome) = self.reserve_key(&meta, "LinkProjectToGoal", project_id).await? {
            return Ok(outcome);
        }

        let project = self.load_existing(project_id).await?;
        let event = project.add_goal(goal_id)?;
        let (state, rows) = self
            .repository
            .save(project, vec![event], meta.known_version, &meta.context)
            .await?;
        Ok(applied(&state, rows))
    }

    /// Execute `UnlinkProjectFromGoal`.
    pub async fn unlink_from_goal(
        &self,
        project_id: &str,
        meta: CommandMeta,
    ) -> Result<CommandOutcome, AppError> {
        if let Some(outcome) = self
            .reserve_key(&meta, "UnlinkProjectFromGoal", project_id)
            .await?
        {
            return Ok(outcome);
        }

        let project = self.load_existing(project_id).await?;
        let event = project.remove_goal()?;
        let (state, rows) = self
            .repository
            .save(project, vec![event], meta.known_version, &meta.context)
            .await?;
        Ok(applied(&state, rows))
    }

    /// Execute `TransitionProjectStatus`.
    pub async fn transition_status(
        &self,
        command: TransitionProjectStatusCommand,
        meta: CommandMeta,
    ) -> Result<CommandOutcome, AppError> {
        if let Some(outcome) = self
            .reserve_key(&meta, "TransitionProjectStatus", &command.project_id)
            .await?
        {
            return Ok(outcome);
        }

        let project = self.load_existing(&command.project_id).await?;
        let event = project.transition_status(command.to)?;
        let (state, rows) = self
            .repository
            .save(project, vec![event], meta.known_version, &meta.context)
            .await?;
        Ok(applied(&state, rows))
    }

    /// Convenience wrapper for marking a project completed.
    pub async fn complete(
        &self,
        project_id: &str,
        meta: CommandMeta,
    ) -> Result<CommandOutcome, AppError> {
        self.transition_status(
            TransitionProjectStatusCommand {
                project_id: project_id.to_string(),
                to: ProjectStatus::Completed,
            },
            meta,
        )
        .await
    }

    /// Execute `ArchiveProject`.
    pub async fn archive(
        &self,
        project_id: &str,
        meta: CommandMeta,
    ) -> Result<CommandOutcome, AppError> {
        if let Some(outcome) = self.reserve_key(&meta, "ArchiveProject", project_id).await? {
            return Ok(outcome);
        }

        let project = self.load_existing(project_id).await?;
        let event = project.archive()?;
        let (state, rows) = self
            .repository
            .save(project, vec![event], meta.known_version, &meta.context)
            .await?;
        Ok(applied(&state, rows))
    }

    async fn load_existing(&self, project_id: &str) -> Result<Project, AppError> {
        self.repository.load(project_id).await?.ok_or_else(|| {
            AppError::validation("project_id", format!("project not found: {}", project_id))
        })
    }

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

fn applied(state: &Project, rows: Vec<StoredEventRow>) -> CommandOutcome {
    CommandOutcome::Applied {
        aggregate_id: state.id().to_string(),
        version: state.version(),
        commit_sequences: rows.into_iter().map(|r| r.commit_sequence).collect(),
    }
}
