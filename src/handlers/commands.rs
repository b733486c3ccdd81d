//! Command definitions
//!
//! Commands represent intentions to change the system state. Every command
//! carries optional optimistic-concurrency and idempotency metadata.

use serde::{Deserialize, Serialize};

use crate::domain::{EventContext, ProjectStatus};

/// Shared command metadata.
#[derive(Debug, Clone, Default)]
pub struct CommandMeta {
    /// Aggregate version the caller decided against; `None` skips the check
    pub known_version: Option<i64>,

    /// Caller-supplied at-most-once token
    pub idempotency_key: Option<String>,

    /// Actor and correlation metadata stamped onto produced events
    pub context: EventContext,
}

impl CommandMeta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_known_version(mut self, version: i64) -> Self {
        self.known_version = Some(version);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_context(mut self, context: EventContext) -> Self {
        self.context = context;
        self
    }
}

/// Command to create a new goal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateGoalCommand {
    pub goal_id: String,
    pub title: String,
    pub category: String,
    pub target_month: String,
}

impl CreateGoalCommand {
    pub fn new(
        goal_id: impl Into<String>,
        title: impl Into<String>,
        category: impl Into<String>,
        target_month: impl Into<String>,
    ) -> Self {
        Self {
            goal_id: goal_id.into(),
            title: title.into(),
            category: category.into(),
            target_month: target_month.into(),
        }
    }
}

/// Command to create a new project
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateProjectCommand {
    pub project_id: String,
    pub title: String,
    pub goal_id: Option<String>,
}

impl CreateProjectCommand {
    pub fn new(project_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            title: title.into(),
            goal_id: None,
        }
    }

    pub fn with_goal(mut self, goal_id: impl Into<String>) -> Self {
        self.goal_id = Some(goal_id.into());
        self
    }
}

/// Command to move a project between statuses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionProjectStatusCommand {
    pub project_id: String,
    pub to: ProjectStatus,
}

/// Outcome of executing a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Events were appended
    Applied {
        aggregate_id: String,
        version: i64,
        commit_sequences: Vec<i64>,
    },

    /// The idempotency key was already recorded; nothing was changed
    AlreadyApplied { aggregate_id: String },
}

impl CommandOutcome {
    pub fn aggregate_id(&self) -> &str {
        match self {
            CommandOutcome::Applied { aggregate_id, .. } => aggregate_id,
            CommandOutcome::AlreadyApplied { aggregate_id } => aggregate_id,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, CommandOutcome::Applied { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_meta_builder() {
        let meta = CommandMeta::new()
            .with_known_version(3)
            .with_idempotency_key("goal-achieve:g1:e9");

        assert_eq!(meta.known_version, Some(3));
        assert_eq!(meta.idempotency_key.as_deref(), Some("goal-achieve:g1:e9"));
    }

    #[test]
    fn test_create_project_with_goal() {
        let cmd = CreateProjectCommand::new("proj-1", "Train").with_goal("goal-1");
        assert_eq!(cmd.goal_id.as_deref(), Some("goal-1"));
    }
}
