//! Scheduled Jobs
//!
//! Background maintenance: pruning of old synced events behind the slowest
//! projection cursor, and cleanup of expired idempotency keys.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::interval;

use crate::db::LocalDb;
use crate::event_store::IdempotencyStore;
use crate::projection::ProjectionMetaStore;

/// Prune synced events that every projection has long passed.
///
/// An event is prunable only when it has a `sync_event_map` row, sits more
/// than `prune_window` commit sequences behind the slowest projection
/// cursor, and its aggregate has a snapshot at or beyond its version.
/// Pending events are never pruned.
pub async fn prune_synced_events(db: &LocalDb, prune_window: i64) -> Result<u64, JobError> {
    let Some(min_cursor) = ProjectionMetaStore::new(db.clone())
        .min_last_commit_sequence()
        .await?
    else {
        return Ok(0);
    };

    let threshold = min_cursor - prune_window;
    if threshold <= 0 {
        return Ok(0);
    }

    let candidates: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT e.id FROM events e
        JOIN sync_event_map m ON m.event_id = e.id
        JOIN snapshots s
          ON s.aggregate_type = e.aggregate_type AND s.aggregate_id = e.aggregate_id
        WHERE e.commit_sequence <= ?1 AND s.snapshot_version >= e.version
        "#,
    )
    .bind(threshold)
    .fetch_all(db.pool())
    .await?;

    let mut rows_deleted = 0u64;
    for event_id in &candidates {
        // The mapping goes first so no map row ever points at a missing
        // event.
        sqlx::query("DELETE FROM sync_event_map WHERE event_id = ?1")
            .bind(event_id)
            .execute(db.pool())
            .await?;

        rows_deleted += sqlx::query("DELETE FROM events WHERE id = ?1")
            .bind(event_id)
            .execute(db.pool())
            .await?
            .rows_affected();
    }

    if rows_deleted > 0 {
        tracing::info!(
            rows_deleted = rows_deleted,
            threshold = threshold,
            "Pruned synced events behind projection cursors"
        );
    }

    Ok(rows_deleted)
}

/// Delete idempotency keys older than the TTL.
pub async fn cleanup_expired_idempotency_keys(
    db: &LocalDb,
    cutoff: DateTime<Utc>,
) -> Result<u64, JobError> {
    let rows_deleted = IdempotencyStore::new(db.clone())
        .delete_older_than(cutoff)
        .await?;

    if rows_deleted > 0 {
        tracing::info!(
            rows_deleted = rows_deleted,
            "Deleted expired idempotency keys"
        );
    }

    Ok(rows_deleted)
}

/// Configuration for the job scheduler
#[derive(Debug, Clone)]
pub struct JobSchedulerConfig {
    /// Interval for event pruning (default: 1 hour)
    pub prune_interval: Duration,
    /// Retention window in commit sequences behind the slowest projection
    pub prune_window: i64,
    /// Interval for idempotency key cleanup (default: 1 hour)
    pub idempotency_cleanup_interval: Duration,
    /// Idempotency key lifetime (default: 30 days)
    pub idempotency_ttl: chrono::Duration,
}

impl Default for JobSchedulerConfig {
    fn default() -> Self {
        Self {
            prune_interval: Duration::from_secs(3600),
            prune_window: 10_000,
            idempotency_cleanup_interval: Duration::from_secs(3600),
            idempotency_ttl: chrono::Duration::days(30),
        }
    }
}

/// Job Scheduler - runs periodic maintenance tasks
pub struct JobScheduler {
    db: LocalDb,
    config: JobSchedulerConfig,
}

impl JobScheduler {
    pub fn new(db: LocalDb) -> Self {
        Self {
            db,
            config: JobSchedulerConfig::default(),
        }
    }

    pub fn with_config(db: LocalDb, config: JobSchedulerConfig) -> Self {
        Self { db, config }
    }

    /// Start the scheduler in the background.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        tracing::info!("Job scheduler started");

        let mut prune_interval = interval(self.config.prune_interval);
        let mut idempotency_interval = interval(self.config.idempotency_cleanup_interval);

        loop {
            tokio::select! {
                _ = prune_interval.tick() => {
                    if let Err(e) = prune_synced_events(&self.db, self.config.prune_window).await {
                        tracing::error!(error = %e, "Event pruning failed");
                    }
                }
                _ = idempotency_interval.tick() => {
                    let cutoff = Utc::now() - self.config.idempotency_ttl;
                    if let Err(e) = cleanup_expired_idempotency_keys(&self.db, cutoff).await {
                        tracing::error!(error = %e, "Idempotency key cleanup failed");
                    }
                }
            }
        }
    }

    /// Run all maintenance jobs once (for manual trigger or testing).
    pub async fn run_all_once(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();

        match prune_synced_events(&self.db, self.config.prune_window).await {
            Ok(count) => report.events_pruned = count,
            Err(e) => report.errors.push(format!("Event pruning: {}", e)),
        }

        let cutoff = Utc::now() - self.config.idempotency_ttl;
        match cleanup_expired_idempotency_keys(&self.db, cutoff).await {
            Ok(count) => report.idempotency_keys_deleted = count,
            Err(e) => report.errors.push(format!("Idempotency cleanup: {}", e)),
        }

        report.completed_at = Utc::now();
        report
    }
}

/// Report from running maintenance jobs
#[derive(Debug, Clone, Default)]
pub struct MaintenanceReport {
    pub events_pruned: u64,
    pub idempotency_keys_deleted: u64,
    pub errors: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

/// Job execution errors
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    EventStore(#[from] crate::event_store::EventStoreError),

    #[error(transparent)]
    Projection(#[from] crate::projection::ProjectionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_config_default() {
        let config = JobSchedulerConfig::default();
        assert_eq!(config.prune_interval, Duration::from_secs(3600));
        assert_eq!(config.prune_window, 10_000);
        assert_eq!(config.idempotency_ttl, chrono::Duration::days(30));
    }

    #[tokio::test]
    async fn test_prune_with_no_projections_is_a_no_op() {
        let db = LocalDb::connect("sqlite::memory:").await.unwrap();
        assert_eq!(prune_synced_events(&db, 10).await.unwrap(), 0);
    }

    #[test]
    fn test_maintenance_report_default() {
        let report = MaintenanceReport::default();
        assert_eq!(report.events_pruned, 0);
        assert!(report.errors.is_empty());
    }
}
