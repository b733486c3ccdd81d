//! Goal Aggregate
//!
//! A goal targets a month, carries a category for rollups, and flips
//! between achieved and not as its linked projects complete.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

use super::{Aggregate, AggregateType, GoalEvent, GoalListItem, HasListItem};

/// Goal aggregate state, derived from events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    id: String,
    title: String,
    category: String,
    target_month: String,
    achieved: bool,
    archived: bool,
    version: i64,
    created_at: Option<DateTime<Utc>>,
    archived_at: Option<DateTime<Utc>>,
}

impl Default for Goal {
    fn default() -> Self {
        Self {
            id: String::new(),
            title: String::new(),
            category: String::new(),
            target_month: String::new(),
            achieved: false,
            archived: false,
            version: 0,
            created_at: None,
            archived_at: None,
        }
    }
}

impl Goal {
    /// Create a new goal and the creation event.
    pub fn create(
        goal_id: impl Into<String>,
        title: impl Into<String>,
        category: impl Into<String>,
        target_month: impl Into<String>,
    ) -> (Self, GoalEvent) {
        let goal_id = goal_id.into();
        let now = Utc::now();

        let event = GoalEvent::GoalCreated {
            goal_id: goal_id.clone(),
            title: title.into(),
            category: category.into(),
            target_month: target_month.into(),
            created_at: now,
        };

        let goal = Goal::default().apply(event.clone());
        (goal, event)
    }

    pub fn rename(&self, title: impl Into<String>) -> Result<GoalEvent, AppError> {
        self.ensure_not_archived()?;
        let title = title.into();
        if title.trim().is_empty() {
            return Err(AppError::validation("title", "must not be empty"));
        }
        Ok(GoalEvent::GoalRenamed {
            goal_id: self.id.clone(),
            title,
        })
    }

    pub fn reschedule(&self, target_month: impl Into<String>) -> Result<GoalEvent, AppError> {
        self.ensure_not_archived()?;
        Ok(GoalEvent::GoalRescheduled {
            goal_id: self.id.clone(),
            target_month: target_month.into(),
        })
    }

    pub fn recategorize(&self, category: impl Into<String>) -> Result<GoalEvent, AppError> {
        self.ensure_not_archived()?;
        Ok(GoalEvent::GoalRecategorized {
            goal_id: self.id.clone(),
            category: category.into(),
        })
    }

    pub fn achieve(&self) -> Result<GoalEvent, AppError> {
        self.ensure_not_archived()?;
        if self.achieved {
            return Err(AppError::validation("goal", "goal is already achieved"));
        }
        Ok(GoalEvent::GoalAchieved {
            goal_id: self.id.clone(),
            achieved_at: Utc::now(),
        })
    }

    pub fn unachieve(&self) -> Result<GoalEvent, AppError> {
        self.ensure_not_archived()?;
        if !self.achieved {
            return Err(AppError::validation("goal", "goal is not achieved"));
        }
        Ok(GoalEvent::GoalUnachieved {
            goal_id: self.id.clone(),
        })
    }

    pub fn archive(&self) -> Result<GoalEvent, AppError> {
        self.ensure_not_archived()?;
        Ok(GoalEvent::GoalArchived {
            goal_id: self.id.clone(),
            archived_at: Utc::now(),
        })
    }

    fn ensure_not_archived(&self) -> Result<(), AppError> {
        if self.archived {
            return Err(AppError::validation("goal", "goal is archived"));
        }
        Ok(())
    }

    /// List item for search and UI surfaces; archived goals have none.
    pub fn to_list_item(&self) -> Option<GoalListItem> {
        if self.archived || self.version == 0 {
            return None;
        }
        Some(GoalListItem {
            id: self.id.clone(),
            title: self.title.clone(),
            category: self.category.clone(),
            target_month: self.target_month.clone(),
            achieved: self.achieved,
            created_at: self.created_at.unwrap_or_else(Utc::now),
        })
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn target_month(&self) -> &str {
        &self.target_month
    }

    pub fn is_achieved(&self) -> bool {
        self.achieved
    }

    pub fn is_archived(&self) -> bool {
        self.archived
    }

    pub fn archived_at(&self) -> Option<DateTime<Utc>> {
        self.archived_at
    }
}

impl HasListItem for Goal {
    type Item = GoalListItem;

    fn list_item(&self) -> Option<GoalListItem> {
        self.to_list_item()
    }
}

impl Aggregate for Goal {
    type Event = GoalEvent;

    fn aggregate_type() -> AggregateType {
        AggregateType::Goal
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn apply(mut self, event: Self::Event) -> Self {
        match event {
            GoalEvent::GoalCreated {
                goal_id,
                title,
                category,
                target_month,
                created_at,
            } => {
                self.id = goal_id;
                self.title = title;
                self.category = category;
                self.target_month = target_month;
                self.achieved = false;
                self.archived = false;
                self.created_at = Some(created_at);
            }
            GoalEvent::GoalRenamed { title, .. } => {
                self.title = title;
            }
            GoalEvent::GoalRescheduled { target_month, .. } => {
                self.target_month = target_month;
            }
            GoalEvent::GoalRecategorized { category, .. } => {
                self.category = category;
            }
            GoalEvent::GoalAchieved { .. } => {
                self.achieved = true;
            }
            GoalEvent::GoalUnachieved { .. } => {
                self.achieved = false;
            }
            GoalEvent::GoalArchived { archived_at, .. } => {
                self.archived = true;
                self.archived_at = Some(archived_at);
            }
        }

        self.version += 1;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_goal_create() {
        let (goal, event) = Goal::create("goal-1", "Run a marathon", "health", "2026-10");

        assert_eq!(goal.id(), "goal-1");
        assert_eq!(goal.title(), "Run a marathon");
        assert_eq!(goal.version(), 1);
        assert!(!goal.is_achieved());
        assert!(matches!(event, GoalEvent::GoalCreated { .. }));
    }

    #[test]
    fn test_goal_achieve_and_unachieve() {
        let (goal, _) = Goal::create("goal-1", "Run a marathon", "health", "2026-10");

        let event = goal.achieve().unwrap();
        let goal = goal.apply(event);
        assert!(goal.is_achieved());
        assert_eq!(goal.version(), 2);

        // Achieving twice is rejected
        assert!(goal.achieve().is_err());

        let event = goal.unachieve().unwrap();
        let goal = goal.apply(event);
        assert!(!goal.is_achieved());
        assert_eq!(goal.version(), 3);
    }

    #[test]
    fn test_rename_to_empty_title_rejected() {
        let (goal, _) = Goal::create("goal-1", "Run a marathon", "health", "2026-10");
        assert!(goal.rename("").is_err());
        assert!(goal.rename("   ").is_err());
        assert!(goal.rename("Finish a marathon").is_ok());
    }

    #[test]
    fn test_archived_goal_rejects_edits() {
        let (goal, _) = Goal::create("goal-1", "Run a marathon", "health", "2026-10");
        let goal = goal.clone().apply(goal.archive().unwrap());

        assert!(goal.is_archived());
        assert!(goal.rename("New title").is_err());
        assert!(goal.achieve().is_err());
        assert!(goal.archive().is_err());
        assert!(goal.to_list_item().is_none());
    }

    #[test]
    fn test_list_item_reflects_state() {
        let (goal, _) = Goal::create("goal-1", "Run a marathon", "health", "2026-10");
        let goal = goal.clone().apply(goal.rename("Finish a marathon").unwrap());

        let item = goal.to_list_item().unwrap();
        assert_eq!(item.title, "Finish a marathon");
        assert_eq!(item.category, "health");
        assert_eq!(item.target_month, "2026-10");
        assert!(!item.achieved);
    }
}
