//! List items
//!
//! Typed read-model items reconstructed by the snapshot projectors and fed
//! into the search index.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ProjectStatus;

/// Read-model item for an active goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalListItem {
    pub id: String,
    pub title: String,
    pub category: String,
    pub target_month: String,
    pub achieved: bool,
    pub created_at: DateTime<Utc>,
}

/// Read-model item for an active project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectListItem {
    pub id: String,
    pub title: String,
    pub status: ProjectStatus,
    pub goal_id: Option<String>,
    pub created_at: DateTime<Utc>,
}
