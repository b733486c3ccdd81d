//! Pending-event version rewriter
//!
//! When remote events interleave below local pending events, the pending
//! tail must shift past the incoming remote max. The payload AAD binds each
//! ciphertext to its stream version, so every shifted event is decrypted
//! with the old-version AAD and re-encrypted with the new one. The
//! aggregate's snapshot is invalidated by the rewrite and purged.

use std::sync::Arc;

use crate::codec::aad;
use crate::crypto::{CryptoService, KeyringManager};
use crate::db::{LocalDb, TABLE_EVENTS};
use crate::event_store::SnapshotStore;

use super::{SyncError, SyncEventMapStore};

/// Result of one rewrite pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteOutcome {
    pub old_max_version: i64,
    pub new_max_version: i64,
    pub shifted: usize,
}

/// Rewrites pending event versions after a rebase.
pub struct PendingEventVersionRewriter {
    db: LocalDb,
    crypto: Arc<dyn CryptoService>,
    keyring: Arc<KeyringManager>,
    map: SyncEventMapStore,
    snapshots: SnapshotStore,
}

impl PendingEventVersionRewriter {
    pub fn new(
        db: LocalDb,
        crypto: Arc<dyn CryptoService>,
        keyring: Arc<KeyringManager>,
    ) -> Self {
        Self {
            map: SyncEventMapStore::new(db.clone()),
            snapshots: SnapshotStore::new(db.clone()),
            db,
            crypto,
            keyring,
        }
    }

    /// Shift this aggregate's pending events to sit contiguously above
    /// `remote_max_version`, re-encrypting each payload for its new
    /// version.
    pub async fn rewrite_pending(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        remote_max_version: i64,
    ) -> Result<RewriteOutcome, SyncError> {
        let pending = self
            .map
            .pending_for_aggregate_desc(aggregate_type, aggregate_id, 1)
            .await?;

        if pending.is_empty() {
            return Ok(RewriteOutcome {
                old_max_version: remote_max_version,
                new_max_version: remote_max_version,
                shifted: 0,
            });
        }

        let old_max_version = pending.first().map(|r| r.version).unwrap_or(0);
        let old_min_version = pending.last().map(|r| r.version).unwrap_or(0);
        let shift = remote_max_version + 1 - old_min_version;

        if shift <= 0 {
            return Ok(RewriteOutcome {
                old_max_version,
                new_max_version: old_max_version,
                shifted: 0,
            });
        }

        // Re-encrypt outside the transaction; the single-connection pool
        // cannot serve key lookups while a transaction holds it.
        let mut updates = Vec::with_capacity(pending.len());
        for row in &pending {
            let new_version = row.version + shift;
            let key = self
                .keyring
                .resolve_key_for_event(aggregate_id, row.epoch, row.keyring_update.as_deref())
                .await
                .map_err(SyncError::Crypto)?;

            let plaintext = self.crypto.decrypt(
                &row.payload_encrypted,
                &key,
                &aad::event_payload(aggregate_type, aggregate_id, &row.event_type, row.version),
            )?;
            let reencrypted = self.crypto.encrypt(
                &plaintext,
                &key,
                &aad::event_payload(aggregate_type, aggregate_id, &row.event_type, new_version),
            )?;

            updates.push((row.commit_sequence, new_version, reencrypted));
        }

        // Descending order avoids transient UNIQUE collisions while rows
        // move up.
        let mut tx = self.db.pool().begin().await?;
        for (commit_sequence, new_version, payload) in &updates {
            sqlx::query(
                r#"
                UPDATE events SET version = ?1, payload_encrypted = ?2
                WHERE commit_sequence = ?3
                "#,
            )
            .bind(new_version)
            .bind(payload)
            .bind(commit_sequence)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        self.snapshots.purge(aggregate_type, aggregate_id).await?;
        self.db.notify_table_changed(TABLE_EVENTS);

        let outcome = RewriteOutcome {
            old_max_version,
            new_max_version: old_max_version + shift,
            shifted: updates.len(),
        };

        tracing::info!(
            aggregate_type = %aggregate_type,
            aggregate_id = %aggregate_id,
            shift = shift,
            shifted = outcome.shifted,
            new_max_version = outcome.new_max_version,
            "Rewrote pending event versions"
        );

        Ok(outcome)
    }
}
