//! momentum-local store doctor
//!
//! Opens the local store, ensures the schema, and verifies the store-level
//! invariants: per-aggregate version contiguity, sync-map consistency, and
//! cursor sanity. Exits 0 when the store is healthy, non-zero otherwise.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use momentum_local::db;
use momentum_local::sync::{SyncEventMapStore, SyncMetaStore};
use momentum_local::{Config, LocalDb};

/// Initialize tracing/logging
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "momentum_local=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::from_env()?;

    tracing::info!(database_url = %config.database_url, "Opening local store");
    let db = LocalDb::connect(&config.database_url).await?;

    if !db::check_schema(db.pool()).await? {
        tracing::error!("Store schema is incomplete");
        return Err(anyhow::anyhow!("store schema incomplete"));
    }

    let event_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events")
        .fetch_one(db.pool())
        .await?;
    let map = SyncEventMapStore::new(db.clone());
    let pending = map.pending_events(i64::MAX).await?.len();
    let max_mapped = map.max_mapped_global_seq().await?;
    let last_pulled = SyncMetaStore::new(db.clone())
        .last_pulled_global_seq(&config.store_id)
        .await?;

    tracing::info!(
        store_id = %config.store_id,
        events = event_count,
        pending = pending,
        max_mapped_global_seq = max_mapped,
        last_pulled_global_seq = last_pulled,
        "Store summary"
    );

    if last_pulled < max_mapped {
        tracing::warn!(
            last_pulled = last_pulled,
            max_mapped = max_mapped,
            "Pull cursor trails the highest mapped global sequence"
        );
    }

    let violations = db::verify_store_invariants(db.pool()).await?;
    if violations.is_empty() {
        tracing::info!("All store invariants hold");
        Ok(())
    } else {
        for violation in &violations {
            tracing::error!(violation = %violation, "Invariant violated");
        }
        Err(anyhow::anyhow!(
            "{} store invariant(s) violated",
            violations.len()
        ))
    }
}
