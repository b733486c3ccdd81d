//! Domain Events
//!
//! Event definitions for the goal and project streams. Events are immutable
//! facts; the serde tag is the persisted event type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::DomainEvent;

/// Status of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Planned,
    InProgress,
    Completed,
}

impl Default for ProjectStatus {
    fn default() -> Self {
        Self::Planned
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProjectStatus::Planned => write!(f, "planned"),
            ProjectStatus::InProgress => write!(f, "in_progress"),
            ProjectStatus::Completed => write!(f, "completed"),
        }
    }
}

/// Goal-related events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GoalEvent {
    /// Goal was created
    GoalCreated {
        goal_id: String,
        title: String,
        category: String,
        /// Month the goal targets, `YYYY-MM`
        target_month: String,
        created_at: DateTime<Utc>,
    },

    /// Goal title changed
    GoalRenamed { goal_id: String, title: String },

    /// Goal moved to a different target month
    GoalRescheduled { goal_id: String, target_month: String },

    /// Goal assigned a different category
    GoalRecategorized { goal_id: String, category: String },

    /// All linked projects completed; goal marked achieved
    GoalAchieved {
        goal_id: String,
        achieved_at: DateTime<Utc>,
    },

    /// A linked project reopened; goal no longer achieved
    GoalUnachieved { goal_id: String },

    /// Goal archived (soft delete)
    GoalArchived {
        goal_id: String,
        archived_at: DateTime<Utc>,
    },
}

impl DomainEvent for GoalEvent {
    fn event_type(&self) -> &'static str {
        match self {
            GoalEvent::GoalCreated { .. } => "GoalCreated",
            GoalEvent::GoalRenamed { .. } => "GoalRenamed",
            GoalEvent::GoalRescheduled { .. } => "GoalRescheduled",
            GoalEvent::GoalRecategorized { .. } => "GoalRecategorized",
            GoalEvent::GoalAchieved { .. } => "GoalAchieved",
            GoalEvent::GoalUnachieved { .. } => "GoalUnachieved",
            GoalEvent::GoalArchived { .. } => "GoalArchived",
        }
    }
}

impl GoalEvent {
    /// Get the goal ID this event relates to
    pub fn goal_id(&self) -> &str {
        match self {
            GoalEvent::GoalCreated { goal_id, .. } => goal_id,
            GoalEvent::GoalRenamed { goal_id, .. } => goal_id,
            GoalEvent::GoalRescheduled { goal_id, .. } => goal_id,
            GoalEvent::GoalRecategorized { goal_id, .. } => goal_id,
            GoalEvent::GoalAchieved { goal_id, .. } => goal_id,
            GoalEvent::GoalUnachieved { goal_id, .. } => goal_id,
            GoalEvent::GoalArchived { goal_id, .. } => goal_id,
        }
    }
}

/// Project-related events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProjectEvent {
    /// Project was created, optionally linked to a goal from the start
    ProjectCreated {
        project_id: String,
        title: String,
        goal_id: Option<String>,
        status: ProjectStatus,
        created_at: DateTime<Utc>,
    },

    /// Project title changed
    ProjectRenamed { project_id: String, title: String },

    /// Project linked to a goal
    ProjectGoalAdded { project_id: String, goal_id: String },

    /// Project unlinked from its goal
    ProjectGoalRemoved { project_id: String, goal_id: String },

    /// Project moved between statuses
    ProjectStatusTransitioned {
        project_id: String,
        from: ProjectStatus,
        to: ProjectStatus,
    },

    /// Project archived (soft delete)
    ProjectArchived {
        project_id: String,
        archived_at: DateTime<Utc>,
    },
}

impl DomainEvent for ProjectEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ProjectEvent::ProjectCreated { .. } => "ProjectCreated",
            ProjectEvent::ProjectRenamed { .. } => "ProjectRenamed",
            ProjectEvent::ProjectGoalAdded { .. } => "ProjectGoalAdded",
            ProjectEvent::ProjectGoalRemoved { .. } => "ProjectGoalRemoved",
            ProjectEvent::ProjectStatusTransitioned { .. } => "ProjectStatusTransitioned",
            ProjectEvent::ProjectArchived { .. } => "ProjectArchived",
        }
    }
}

impl ProjectEvent {
    /// Get the project ID this event relates to
    pub fn project_id(&self) -> &str {
        match self {
            ProjectEvent::ProjectCreated { project_id, .. } => project_id,
            ProjectEvent::ProjectRenamed { project_id, .. } => project_id,
            ProjectEvent::ProjectGoalAdded { project_id, .. } => project_id,
            ProjectEvent::ProjectGoalRemoved { project_id, .. } => project_id,
            ProjectEvent::ProjectStatusTransitioned { project_id, .. } => project_id,
            ProjectEvent::ProjectArchived { project_id, .. } => project_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_goal_event_serialization_carries_tag() {
        let event = GoalEvent::GoalRenamed {
            goal_id: "goal-1".to_string(),
            title: "Run a marathon".to_string(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"GoalRenamed""#));

        let deserialized: GoalEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, event);
        assert_eq!(deserialized.event_type(), "GoalRenamed");
    }

    #[test]
    fn test_unknown_event_type_fails_decode() {
        let result = serde_json::from_str::<GoalEvent>(r#"{"type":"GoalTeleported"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_project_status_serialization() {
        let json = serde_json::to_string(&ProjectStatus::InProgress).unwrap();
        assert_eq!(json, r#""in_progress""#);
    }
}
