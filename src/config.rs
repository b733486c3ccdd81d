//! Configuration module
//!
//! Loads configuration from environment variables.

use std::env;

/// Store configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database URL for the local store
    pub database_url: String,

    /// Per-device store id used by the sync protocol
    pub store_id: String,

    /// Long-poll hold passed to `sync/pull` (milliseconds)
    pub pull_wait_ms: u64,

    /// Maximum events requested per pull page
    pub pull_limit: i64,

    /// Maximum pending events submitted per push
    pub push_batch_size: i64,

    /// Bounded retries for a single push attempt
    pub max_push_retries: u32,

    /// Debounce applied to the events-table push trigger (milliseconds)
    pub push_debounce_ms: u64,

    /// Events read per projection catch-up batch
    pub projection_batch_size: i64,

    /// Commit sequences kept behind the slowest projection cursor before
    /// synced events become prunable
    pub prune_window: i64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            env::var("MOMENTUM_DATABASE_URL").unwrap_or_else(|_| "sqlite::memory:".to_string());

        let store_id = env::var("MOMENTUM_STORE_ID")
            .map_err(|_| ConfigError::MissingEnv("MOMENTUM_STORE_ID"))?;

        let pull_wait_ms = env::var("MOMENTUM_PULL_WAIT_MS")
            .unwrap_or_else(|_| "20000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("MOMENTUM_PULL_WAIT_MS"))?;

        let pull_limit = env::var("MOMENTUM_PULL_LIMIT")
            .unwrap_or_else(|_| "500".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("MOMENTUM_PULL_LIMIT"))?;

        let push_batch_size = env::var("MOMENTUM_PUSH_BATCH_SIZE")
            .unwrap_or_else(|_| "100".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("MOMENTUM_PUSH_BATCH_SIZE"))?;

        let max_push_retries = env::var("MOMENTUM_MAX_PUSH_RETRIES")
            .unwrap_or_else(|_| "2".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("MOMENTUM_MAX_PUSH_RETRIES"))?;

        let push_debounce_ms = env::var("MOMENTUM_PUSH_DEBOUNCE_MS")
            .unwrap_or_else(|_| "100".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("MOMENTUM_PUSH_DEBOUNCE_MS"))?;

        let projection_batch_size = env::var("MOMENTUM_PROJECTION_BATCH_SIZE")
            .unwrap_or_else(|_| "250".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("MOMENTUM_PROJECTION_BATCH_SIZE"))?;

        let prune_window = env::var("MOMENTUM_PRUNE_WINDOW")
            .unwrap_or_else(|_| "10000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("MOMENTUM_PRUNE_WINDOW"))?;

        Ok(Self {
            database_url,
            store_id,
            pull_wait_ms,
            pull_limit,
            push_batch_size,
            max_push_retries,
            push_debounce_ms,
            projection_batch_size,
            prune_window,
        })
    }

    /// Defaults suitable for tests and embedded hosts
    pub fn for_store(store_id: impl Into<String>) -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            store_id: store_id.into(),
            pull_wait_ms: 20_000,
            pull_limit: 500,
            push_batch_size: 100,
            max_push_retries: 2,
            push_debounce_ms: 100,
            projection_batch_size: 250,
            prune_window: 10_000,
        }
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}
