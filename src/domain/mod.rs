//! Domain module
//!
//! Core domain types: the closed aggregate set, the aggregate and event
//! traits, and the goal/project aggregates with their reducers.

pub mod events;
pub mod goal;
pub mod list_item;
pub mod project;

pub use events::{GoalEvent, ProjectEvent, ProjectStatus};
pub use goal::Goal;
pub use list_item::{GoalListItem, ProjectListItem};
pub use project::Project;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Closed set of aggregate types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateType {
    Goal,
    Project,
}

impl AggregateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateType::Goal => "goal",
            AggregateType::Project => "project",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "goal" => Some(AggregateType::Goal),
            "project" => Some(AggregateType::Project),
            _ => None,
        }
    }
}

impl std::fmt::Display for AggregateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata stamped onto events produced by a command.
#[derive(Debug, Clone, Default)]
pub struct EventContext {
    pub actor_id: Option<String>,
    pub causation_id: Option<String>,
    pub correlation_id: Option<String>,
}

impl EventContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn with_causation(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// A typed domain event.
///
/// Serialized form is the canonical payload `data`; the serde tag doubles
/// as the stored `event_type`.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync {
    /// Event type name as persisted in the store
    fn event_type(&self) -> &'static str;
}

/// Aggregates that project into a read-model list item.
///
/// `None` means the aggregate has left the active list (archived or not
/// yet created).
pub trait HasListItem {
    type Item: Clone + PartialEq + Send + Sync + Serialize + DeserializeOwned;

    fn list_item(&self) -> Option<Self::Item>;
}

/// Aggregate trait that all aggregates must implement.
///
/// State is the fold of the aggregate's events; `apply` is the pure
/// reducer.
pub trait Aggregate: Sized + Default + Serialize + DeserializeOwned + Send {
    /// The type of events this aggregate handles
    type Event: DomainEvent;

    /// Aggregate type within the closed set
    fn aggregate_type() -> AggregateType;

    /// Get the aggregate ID
    fn id(&self) -> &str;

    /// Current version (number of events applied)
    fn version(&self) -> i64;

    /// Apply an event to update the aggregate state
    fn apply(self, event: Self::Event) -> Self;
}
