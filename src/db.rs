//! Database module
//!
//! Local SQLite store: connection setup, idempotent schema creation,
//! store-level invariant checks, and the coalesced table-change notifier
//! that projection runtimes and the sync engine subscribe to.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tokio::sync::broadcast;

/// Tables that participate in change notifications
pub const TABLE_EVENTS: &str = "events";
pub const TABLE_SNAPSHOTS: &str = "snapshots";
pub const TABLE_PROJECTION_CACHE: &str = "projection_cache";
pub const TABLE_INDEX_ARTIFACTS: &str = "index_artifacts";
pub const TABLE_SYNC_EVENT_MAP: &str = "sync_event_map";

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Handle to the local store: a single-writer SQLite pool plus the
/// table-change broadcast channel.
///
/// Injected explicitly into every store and runtime; there are no
/// process-wide globals.
#[derive(Debug, Clone)]
pub struct LocalDb {
    pool: SqlitePool,
    changes: broadcast::Sender<String>,
}

impl LocalDb {
    /// Open (or create) the store at `database_url` and ensure the schema.
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        // One writer: all components in the process share this connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        init_schema(&pool).await?;

        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self { pool, changes })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Announce that `table` changed. Wake-ups are coalesced; listeners
    /// must tolerate spurious fires.
    pub fn notify_table_changed(&self, table: &str) {
        // No receivers is fine; nobody is watching yet.
        let _ = self.changes.send(table.to_string());
    }

    /// Subscribe to change notifications for a set of tables.
    pub fn subscribe_to_tables(&self, tables: &[&str]) -> TableSubscription {
        TableSubscription {
            rx: self.changes.subscribe(),
            tables: tables.iter().map(|t| t.to_string()).collect(),
        }
    }
}

/// A live table-change subscription.
pub struct TableSubscription {
    rx: broadcast::Receiver<String>,
    tables: Vec<String>,
}

impl TableSubscription {
    /// Wait until one of the subscribed tables changes.
    ///
    /// A lagged receiver reports a (possibly spurious) change instead of
    /// missing one.
    pub async fn changed(&mut self) {
        loop {
            match self.rx.recv().await {
                Ok(table) if self.tables.iter().any(|t| *t == table) => return,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => return,
                Err(broadcast::error::RecvError::Closed) => {
                    // Store handle dropped; park forever rather than spin.
                    std::future::pending::<()>().await;
                }
            }
        }
    }
}

/// Create all store tables if they do not exist yet.
///
/// `commit_sequence` is the AUTOINCREMENT rowid of `events`: assigned at
/// insert, strictly increasing, never reused. `id` stays UNIQUE so remote
/// rows ingest idempotently.
pub async fn init_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS events (
            commit_sequence INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            aggregate_type TEXT NOT NULL,
            aggregate_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            payload_encrypted BLOB NOT NULL,
            keyring_update BLOB,
            version INTEGER NOT NULL,
            occurred_at INTEGER NOT NULL,
            actor_id TEXT,
            causation_id TEXT,
            correlation_id TEXT,
            epoch INTEGER,
            UNIQUE (aggregate_type, aggregate_id, version)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS snapshots (
            aggregate_type TEXT NOT NULL,
            aggregate_id TEXT NOT NULL,
            snapshot_version INTEGER NOT NULL,
            snapshot_encrypted BLOB NOT NULL,
            last_effective_cursor TEXT NOT NULL,
            written_at TEXT NOT NULL,
            PRIMARY KEY (aggregate_type, aggregate_id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS projection_cache (
            projection_id TEXT NOT NULL,
            scope_key TEXT NOT NULL,
            cache_version INTEGER NOT NULL,
            cache_encrypted BLOB NOT NULL,
            ordering TEXT NOT NULL,
            last_global_seq INTEGER NOT NULL,
            last_pending_commit_seq INTEGER NOT NULL,
            last_commit_sequence INTEGER NOT NULL,
            written_at TEXT NOT NULL,
            PRIMARY KEY (projection_id, scope_key)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS index_artifacts (
            index_id TEXT NOT NULL,
            scope_key TEXT NOT NULL,
            artifact_version INTEGER NOT NULL,
            artifact_encrypted BLOB NOT NULL,
            last_global_seq INTEGER NOT NULL,
            last_pending_commit_seq INTEGER NOT NULL,
            written_at TEXT NOT NULL,
            PRIMARY KEY (index_id, scope_key)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS projection_meta (
            projection_id TEXT PRIMARY KEY,
            ordering TEXT NOT NULL,
            last_global_seq INTEGER NOT NULL,
            last_pending_commit_seq INTEGER NOT NULL,
            last_commit_sequence INTEGER NOT NULL,
            phase TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS sync_event_map (
            event_id TEXT PRIMARY KEY,
            global_seq INTEGER NOT NULL UNIQUE,
            inserted_at TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS sync_meta (
            store_id TEXT PRIMARY KEY,
            last_pulled_global_seq INTEGER NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS idempotency_keys (
            key TEXT PRIMARY KEY,
            command_type TEXT NOT NULL,
            aggregate_id TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS aggregate_keys (
            aggregate_id TEXT PRIMARY KEY,
            key_wrapped BLOB NOT NULL,
            epoch INTEGER NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    ];

    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }

    Ok(())
}

/// Check that all required tables exist.
pub async fn check_schema(pool: &SqlitePool) -> Result<bool, sqlx::Error> {
    let required_tables = vec![
        "events",
        "snapshots",
        "projection_cache",
        "index_artifacts",
        "projection_meta",
        "sync_event_map",
        "sync_meta",
        "idempotency_keys",
        "aggregate_keys",
    ];

    for table in required_tables {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1
            )
            "#,
        )
        .bind(table)
        .fetch_one(pool)
        .await?;

        if !exists {
            tracing::error!("Required table '{}' does not exist", table);
            return Ok(false);
        }
    }

    Ok(true)
}

/// Verify the store-level invariants and return human-readable violations.
///
/// Checked:
/// - per-aggregate versions are `1..n` without gaps or duplicates
///   (pruned aggregates are exempt below their snapshot version)
/// - every `sync_event_map` row points at an existing event
pub async fn verify_store_invariants(pool: &SqlitePool) -> Result<Vec<String>, sqlx::Error> {
    let mut violations = Vec::new();

    let rows: Vec<(String, String, i64, i64, i64)> = sqlx::query_as(
        r#"
        SELECT aggregate_type, aggregate_id, COUNT(*), MIN(version), MAX(version)
        FROM events
        GROUP BY aggregate_type, aggregate_id
        "#,
    )
    .fetch_all(pool)
    .await?;

    for (aggregate_type, aggregate_id, count, min_version, max_version) in rows {
        let contiguous = max_version - min_version + 1 == count;
        if !contiguous {
            violations.push(format!(
                "versions not contiguous for {}/{}: {} rows spanning v{}..v{}",
                aggregate_type, aggregate_id, count, min_version, max_version
            ));
            continue;
        }

        if min_version != 1 {
            // Legitimate only when pruning removed the prefix behind a snapshot.
            let snapshot_version: Option<i64> = sqlx::query_scalar(
                r#"
                SELECT snapshot_version FROM snapshots
                WHERE aggregate_type = ?1 AND aggregate_id = ?2
                "#,
            )
            .bind(&aggregate_type)
            .bind(&aggregate_id)
            .fetch_optional(pool)
            .await?;

            match snapshot_version {
                Some(v) if v >= min_version - 1 => {}
                _ => violations.push(format!(
                    "versions for {}/{} start at v{} with no covering snapshot",
                    aggregate_type, aggregate_id, min_version
                )),
            }
        }
    }

    let orphaned_mappings: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM sync_event_map m
        WHERE NOT EXISTS (SELECT 1 FROM events e WHERE e.id = m.event_id)
        "#,
    )
    .fetch_one(pool)
    .await?;

    if orphaned_mappings > 0 {
        violations.push(format!(
            "{} sync_event_map rows point at missing events",
            orphaned_mappings
        ));
    }

    Ok(violations)
}
