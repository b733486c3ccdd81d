//! Project Aggregate
//!
//! A project optionally links to one goal; its status transitions feed the
//! goal-achievement process manager.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

use super::{Aggregate, AggregateType, HasListItem, ProjectEvent, ProjectListItem, ProjectStatus};

/// Project aggregate state, derived from events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    id: String,
    title: String,
    goal_id: Option<String>,
    status: ProjectStatus,
    archived: bool,
    version: i64,
    created_at: Option<DateTime<Utc>>,
    archived_at: Option<DateTime<Utc>>,
}

impl Default for Project {
    fn default() -> Self {
        Self {
            id: String::new(),
            title: String::new(),
            goal_id: None,
            status: ProjectStatus::Planned,
            archived: false,
            version: 0,
            created_at: None,
            archived_at: None,
        }
    }
}

impl Project {
    /// Create a new project and the creation event.
    pub fn create(
        project_id: impl Into<String>,
        title: impl Into<String>,
        goal_id: Option<String>,
    ) -> (Self, ProjectEvent) {
        let project_id = project_id.into();
        let event = ProjectEvent::ProjectCreated {
            project_id: project_id.clone(),
            title: title.into(),
            goal_id,
            status: ProjectStatus::Planned,
            created_at: Utc::now(),
        };

        let project = Project::default().apply(event.clone());
        (project, event)
    }

    pub fn rename(&self, title: impl Into<String>) -> Result<ProjectEvent, AppError> {
        self.ensure_not_archived()?;
        let title = title.into();
        if title.trim().is_empty() {
            return Err(AppError::validation("title", "must not be empty"));
        }
        Ok(ProjectEvent::ProjectRenamed {
            project_id: self.id.clone(),
            title,
        })
    }

    pub fn add_goal(&self, goal_id: impl Into<String>) -> Result<ProjectEvent, AppError> {
        self.ensure_not_archived()?;
        let goal_id = goal_id.into();
        if self.goal_id.as_deref() == Some(goal_id.as_str()) {
            return Err(AppError::validation(
                "goal_id",
                "project is already linked to this goal",
            ));
        }
        Ok(ProjectEvent::ProjectGoalAdded {
            project_id: self.id.clone(),
            goal_id,
        })
    }

    pub fn remove_goal(&self) -> Result<ProjectEvent, AppError> {
        self.ensure_not_archived()?;
        let Some(goal_id) = self.goal_id.clone() else {
            return Err(AppError::validation(
                "goal_id",
                "project is not linked to a goal",
            ));
        };
        Ok(ProjectEvent::ProjectGoalRemoved {
            project_id: self.id.clone(),
            goal_id,
        })
    }

    pub fn transition_status(&self, to: ProjectStatus) -> Result<ProjectEvent, AppError> {
        self.ensure_not_archived()?;
        if self.status == to {
            return Err(AppError::validation(
                "status",
                format!("project is already {}", to),
            ));
        }
        Ok(ProjectEvent::ProjectStatusTransitioned {
            project_id: self.id.clone(),
            from: self.status,
            to,
        })
    }

    pub fn archive(&self) -> Result<ProjectEvent, AppError> {
        self.ensure_not_archived()?;
        Ok(ProjectEvent::ProjectArchived {
            project_id: self.id.clone(),
            archived_at: Utc::now(),
        })
    }

    fn ensure_not_archived(&self) -> Result<(), AppError> {
        if self.archived {
            return Err(AppError::validation("project", "project is archived"));
        }
        Ok(())
    }

    /// List item for search and UI surfaces; archived projects have none.
    pub fn to_list_item(&self) -> Option<ProjectListItem> {
        if self.archived || self.version == 0 {
            return None;
        }
        Some(ProjectListItem {
            id: self.id.clone(),
            title: self.title.clone(),
            status: self.status,
            goal_id: self.goal_id.clone(),
            created_at: self.created_at.unwrap_or_else(Utc::now),
        })
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn goal_id(&self) -> Option<&str> {
        self.goal_id.as_deref()
    }

    pub fn status(&self) -> ProjectStatus {
        self.status
    }

    pub fn is_archived(&self) -> bool {
        self.archived
    }
}

impl HasListItem for Project {
    type Item = ProjectListItem;

    fn list_item(&self) -> Option<ProjectListItem> {
        self.to_list_item()
    }
}

impl Aggregate for Project {
    type Event = ProjectEvent;

    fn aggregate_type() -> AggregateType {
        AggregateType::Project
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn apply(mut self, event: Self::Event) -> Self {
        match event {
            ProjectEvent::ProjectCreated {
                project_id,
                title,
                goal_id,
                status,
                created_at,
            } => {
                self.id = project_id;
                self.title = title;
                self.goal_id = goal_id;
                self.status = status;
                self.created_at = Some(created_at);
            }
            ProjectEvent::ProjectRenamed { title, .. } => {
                self.title = title;
            }
            ProjectEvent::ProjectGoalAdded { goal_id, .. } => {
                self.goal_id = Some(goal_id);
            }
            ProjectEvent::ProjectGoalRemoved { .. } => {
                self.goal_id = None;
            }
            ProjectEvent::ProjectStatusTransitioned { to, .. } => {
                self.status = to;
            }
            ProjectEvent::ProjectArchived { archived_at, .. } => {
                self.archived = true;
                self.archived_at = Some(archived_at);
            }
        }

        self.version += 1;
        self
    }
}
