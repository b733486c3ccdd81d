//! Command Handlers module
//!
//! Command handlers orchestrate validation, idempotency, aggregate loading,
//! domain decisions, and persistence. The saga dispatches through the
//! [`CommandDispatcher`] port implemented by the goal handler.

mod commands;
mod goal_handler;
mod project_handler;

pub use commands::*;
pub use goal_handler::GoalCommandHandler;
pub use project_handler::ProjectCommandHandler;

use async_trait::async_trait;

use crate::error::AppError;

/// Dispatch port used by the goal-achievement process manager.
#[async_trait]
pub trait CommandDispatcher: Send + Sync {
    async fn achieve_goal(
        &self,
        goal_id: &str,
        known_version: i64,
        idempotency_key: &str,
    ) -> Result<(), AppError>;

    async fn unachieve_goal(
        &self,
        goal_id: &str,
        known_version: i64,
        idempotency_key: &str,
    ) -> Result<(), AppError>;
}
