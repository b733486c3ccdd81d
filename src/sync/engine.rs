//! Sync engine
//!
//! Background pull and push loops over the sync transport. Pull ingests
//! remote records into the local log and detects when local pending events
//! must be rebased; push submits pending events against the last known
//! head and resolves conflicts by catching up, rewriting pending versions,
//! and retrying.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::crypto::{CryptoService, KeyringManager};
use crate::db::{LocalDb, TABLE_EVENTS};

use super::record::{self, RemoteEvent};
use super::transport::{
    PullRequest, PushEvent, PushOutcome, PushRequest, RemoteEventRecord, SyncDirection,
    SyncTransport, TransportError,
};
use super::{
    PendingEventVersionRewriter, SyncError, SyncEventMapStore, SyncEventRecord, SyncMetaStore,
    SyncState, SyncStatus,
};

const BACKOFF_MIN: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(20);

/// Pace between successful pulls; the transport's long poll does the real
/// waiting.
const PULL_REPOLL_DELAY: Duration = Duration::from_millis(100);

/// Client-side sync engine.
pub struct SyncEngine {
    db: LocalDb,
    transport: Arc<dyn SyncTransport>,
    config: Config,
    meta: SyncMetaStore,
    map: SyncEventMapStore,
    rewriter: PendingEventVersionRewriter,
    status_tx: watch::Sender<SyncStatus>,
    rebase_tx: broadcast::Sender<()>,
    pull_in_flight: AtomicBool,
    push_in_flight: AtomicBool,
    last_known_head: Mutex<Option<i64>>,
    backoff: Mutex<Duration>,
}

/// Handle to the running loops.
pub struct SyncHandle {
    pull_task: tokio::task::JoinHandle<()>,
    push_task: tokio::task::JoinHandle<()>,
    shutdown: CancellationToken,
}

impl SyncHandle {
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub async fn join(self) {
        let _ = tokio::join!(self.pull_task, self.push_task);
    }
}

impl SyncEngine {
    pub fn new(
        db: LocalDb,
        transport: Arc<dyn SyncTransport>,
        crypto: Arc<dyn CryptoService>,
        keyring: Arc<KeyringManager>,
        config: Config,
    ) -> Self {
        let (status_tx, _) = watch::channel(SyncStatus::initial());
        let (rebase_tx, _) = broadcast::channel(16);

        Self {
            meta: SyncMetaStore::new(db.clone()),
            map: SyncEventMapStore::new(db.clone()),
            rewriter: PendingEventVersionRewriter::new(db.clone(), crypto, keyring),
            db,
            transport,
            config,
            status_tx,
            rebase_tx,
            pull_in_flight: AtomicBool::new(false),
            push_in_flight: AtomicBool::new(false),
            last_known_head: Mutex::new(None),
            backoff: Mutex::new(BACKOFF_MIN),
        }
    }

    /// Observe status transitions.
    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status_tx.subscribe()
    }

    /// Subscribe to rebase notifications; projection runtimes rebuild on
    /// every fire.
    pub fn subscribe_rebase(&self) -> broadcast::Receiver<()> {
        self.rebase_tx.subscribe()
    }

    /// One pull pass. Returns whether any remote event was newly applied.
    ///
    /// A no-op if a pull is already in flight.
    pub async fn pull_once(&self, wait_ms: Option<u64>) -> Result<bool, SyncError> {
        if self.pull_in_flight.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }

        let result = self.pull_inner(wait_ms).await;
        self.pull_in_flight.store(false, Ordering::SeqCst);

        match &result {
            Ok(_) => self.mark_success(),
            Err(e) => self.mark_error("server", e),
        }
        result
    }

    async fn pull_inner(&self, wait_ms: Option<u64>) -> Result<bool, SyncError> {
        self.set_state(SyncState::Syncing {
            direction: SyncDirection::Pull,
        });

        let had_pending = self.map.has_pending().await?;
        let mut applied = 0usize;

        loop {
            let since = self
                .meta
                .last_pulled_global_seq(&self.config.store_id)
                .await?;

            let response = self
                .transport
                .pull(PullRequest {
                    store_id: self.config.store_id.clone(),
                    since,
                    limit: self.config.pull_limit,
                    wait_ms,
                })
                .await?;

            *self.last_known_head.lock().unwrap() = Some(response.head);

            if response.events.is_empty() {
                break;
            }

            applied += self.ingest_remote_records(&response.events).await?;

            match response.next_since {
                Some(next) => {
                    self.meta
                        .set_last_pulled_global_seq(&self.config.store_id, next)
                        .await?;
                }
                None if response.has_more => {
                    return Err(TransportError::Protocol(
                        "hasMore=true with nextSince=null".to_string(),
                    )
                    .into());
                }
                None => {}
            }

            if !response.has_more {
                break;
            }
        }

        if applied > 0 && had_pending && self.map.has_pending().await? {
            self.request_rebase();
        }

        Ok(applied > 0)
    }

    /// One push pass: pending events against the last known head, with
    /// bounded conflict retries.
    ///
    /// A no-op if a push is already in flight.
    pub async fn push_once(&self) -> Result<(), SyncError> {
        if self.push_in_flight.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let result = self.push_inner().await;
        self.push_in_flight.store(false, Ordering::SeqCst);

        match &result {
            Ok(_) => self.mark_success(),
            Err(e) => self.mark_error("network", e),
        }
        result
    }

    async fn push_inner(&self) -> Result<(), SyncError> {
        if !self.pull_in_flight.load(Ordering::SeqCst) {
            if let Err(e) = self.pull_once(Some(0)).await {
                tracing::warn!(error = %e, "Pre-push pull failed; pushing anyway");
            }
        }

        self.set_state(SyncState::Syncing {
            direction: SyncDirection::Push,
        });

        let mut rows = self.map.pending_events(self.config.push_batch_size).await?;
        if rows.is_empty() {
            return Ok(());
        }

        let attempts = self.config.max_push_retries.max(1);
        for attempt in 0..attempts {
            let known_head = *self.last_known_head.lock().unwrap();
            let expected_head = match known_head {
                Some(head) => head,
                None => {
                    self.meta
                        .last_pulled_global_seq(&self.config.store_id)
                        .await?
                }
            };

            let mut events = Vec::with_capacity(rows.len());
            for row in &rows {
                events.push(PushEvent {
                    event_id: row.id.clone(),
                    record_json: SyncEventRecord::from_row(row).to_record_json()?,
                });
            }

            let outcome = match self
                .transport
                .push(PushRequest {
                    store_id: self.config.store_id.clone(),
                    expected_head,
                    events,
                })
                .await
            {
                Ok(outcome) => outcome,
                Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                    tracing::warn!(
                        error = %e,
                        attempt = attempt + 1,
                        "Push attempt failed; retrying"
                    );
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            match outcome {
                PushOutcome::Ok { head, assigned } => {
                    for assignment in &assigned {
                        self.map
                            .map_event(&assignment.event_id, assignment.global_sequence)
                            .await?;
                    }

                    let previous = self
                        .meta
                        .last_pulled_global_seq(&self.config.store_id)
                        .await?;
                    self.meta
                        .set_last_pulled_global_seq(&self.config.store_id, previous.max(head))
                        .await?;
                    *self.last_known_head.lock().unwrap() = Some(head);

                    tracing::debug!(pushed = assigned.len(), head = head, "Push accepted");
                    return Ok(());
                }

                PushOutcome::Conflict {
                    head,
                    reason,
                    missing,
                } => {
                    tracing::warn!(
                        reason = ?reason,
                        head = head,
                        missing = missing.len(),
                        "Push conflict; catching up"
                    );
                    self.handle_conflict(head, &missing, expected_head).await?;

                    rows = self.map.pending_events(self.config.push_batch_size).await?;
                    if rows.is_empty() {
                        return Ok(());
                    }
                }
            }
        }

        Err(TransportError::Server("push retries exhausted after repeated conflicts".to_string())
            .into())
    }

    /// Resolve a push conflict.
    ///
    /// With `missing` events the server already told us what to ingest;
    /// otherwise a pull must advance the cursor past the head we pushed
    /// against, or the server is talking nonsense.
    async fn handle_conflict(
        &self,
        head: i64,
        missing: &[RemoteEventRecord],
        expected_head: i64,
    ) -> Result<(), SyncError> {
        if !missing.is_empty() {
            self.ingest_remote_records(missing).await?;

            let previous = self
                .meta
                .last_pulled_global_seq(&self.config.store_id)
                .await?;
            self.meta
                .set_last_pulled_global_seq(&self.config.store_id, previous.max(head))
                .await?;
            *self.last_known_head.lock().unwrap() = Some(head);

            if self.map.has_pending().await? {
                self.request_rebase();
            }
            return Ok(());
        }

        self.pull_once(Some(0)).await?;
        let advanced = self
            .meta
            .last_pulled_global_seq(&self.config.store_id)
            .await?;
        if advanced <= expected_head {
            return Err(TransportError::Protocol(
                "conflict did not advance cursor".to_string(),
            )
            .into());
        }
        Ok(())
    }

    /// Ingest remote records: rewrite colliding pending tails, then insert
    /// rows and their global-sequence mappings. Returns how many events
    /// were newly mapped.
    async fn ingest_remote_records(
        &self,
        records: &[RemoteEventRecord],
    ) -> Result<usize, SyncError> {
        let mut remotes: Vec<(i64, RemoteEvent)> = Vec::with_capacity(records.len());
        for record in records {
            remotes.push((
                record.global_sequence,
                record::dematerialize(&record.event_id, &record.record_json)?,
            ));
        }

        // Version collisions only matter for genuinely foreign events; our
        // own events coming back from the server share their local id.
        let mut remote_max: HashMap<(String, String), i64> = HashMap::new();
        for (_, event) in &remotes {
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM events WHERE id = ?1)")
                    .bind(&event.event_id)
                    .fetch_one(self.db.pool())
                    .await?;
            if exists {
                continue;
            }

            let key = (event.aggregate_type.clone(), event.aggregate_id.clone());
            let entry = remote_max.entry(key).or_insert(event.version);
            *entry = (*entry).max(event.version);
        }

        for ((aggregate_type, aggregate_id), max_version) in &remote_max {
            self.rewriter
                .rewrite_pending(aggregate_type, aggregate_id, *max_version)
                .await?;
        }

        let mut applied = 0usize;
        let mut inserted_any = false;
        for (global_sequence, event) in &remotes {
            let inserted = sqlx::query(
                r#"
                INSERT OR IGNORE INTO events (
                    id, aggregate_type, aggregate_id, event_type,
                    payload_encrypted, keyring_update, version, occurred_at,
                    actor_id, causation_id, correlation_id, epoch
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                "#,
            )
            .bind(&event.event_id)
            .bind(&event.aggregate_type)
            .bind(&event.aggregate_id)
            .bind(&event.event_type)
            .bind(&event.payload_encrypted)
            .bind(&event.keyring_update)
            .bind(event.version)
            .bind(event.occurred_at)
            .bind(&event.actor_id)
            .bind(&event.causation_id)
            .bind(&event.correlation_id)
            .bind(event.epoch)
            .execute(self.db.pool())
            .await?
            .rows_affected();

            inserted_any |= inserted > 0;

            if self.map.map_event(&event.event_id, *global_sequence).await? {
                applied += 1;
            }
        }

        if inserted_any {
            self.db.notify_table_changed(TABLE_EVENTS);
        }

        Ok(applied)
    }

    fn request_rebase(&self) {
        tracing::info!("Remote events interleaved with pending history; rebase required");
        let _ = self.rebase_tx.send(());
    }

    /// Spawn the pull and push loops.
    pub fn start(self: &Arc<Self>) -> SyncHandle {
        let shutdown = CancellationToken::new();

        self.transport
            .set_abort_signal(SyncDirection::Pull, shutdown.child_token());
        self.transport
            .set_abort_signal(SyncDirection::Push, shutdown.child_token());

        let pull_engine = self.clone();
        let pull_token = shutdown.clone();
        let pull_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pull_token.cancelled() => break,
                    result = pull_engine.pull_once(Some(pull_engine.config.pull_wait_ms)) => {
                        let delay = match result {
                            Ok(_) => PULL_REPOLL_DELAY,
                            Err(e) if e.is_retryable() => {
                                tracing::warn!(error = %e, "Pull failed; backing off");
                                pull_engine.current_backoff()
                            }
                            Err(e) => {
                                // Protocol violations are never retried
                                // silently.
                                tracing::error!(
                                    error = %e,
                                    "Pull failed with a non-retryable error; pausing pull loop"
                                );
                                pull_engine.set_state(SyncState::Paused {
                                    reason: e.to_string(),
                                });
                                break;
                            }
                        };
                        tokio::select! {
                            _ = pull_token.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        });

        let push_engine = self.clone();
        let push_token = shutdown.clone();
        let push_task = tokio::spawn(async move {
            let mut subscription = push_engine.db.subscribe_to_tables(&[TABLE_EVENTS]);

            if let Err(e) = push_engine.push_once().await {
                tracing::warn!(error = %e, "Initial push failed");
            }

            loop {
                tokio::select! {
                    _ = push_token.cancelled() => break,
                    _ = subscription.changed() => {
                        tokio::select! {
                            _ = push_token.cancelled() => break,
                            _ = tokio::time::sleep(
                                Duration::from_millis(push_engine.config.push_debounce_ms),
                            ) => {}
                        }
                        if let Err(e) = push_engine.push_once().await {
                            tracing::warn!(error = %e, "Push failed");
                        }
                    }
                }
            }
        });

        SyncHandle {
            pull_task,
            push_task,
            shutdown,
        }
    }

    fn set_state(&self, state: SyncState) {
        self.status_tx.send_modify(|status| status.state = state);
    }

    fn mark_success(&self) {
        *self.backoff.lock().unwrap() = BACKOFF_MIN;
        self.status_tx.send_modify(|status| {
            status.state = SyncState::Idle;
            status.last_success_at = Some(Utc::now());
        });
    }

    fn mark_error(&self, code: &'static str, error: &SyncError) {
        let backoff = {
            let mut backoff = self.backoff.lock().unwrap();
            let current = *backoff;
            *backoff = (current * 2).min(BACKOFF_MAX);
            current
        };

        self.status_tx.send_modify(|status| {
            status.state = SyncState::Error {
                code,
                retry_at: Some(
                    Utc::now()
                        + chrono::Duration::from_std(backoff)
                            .unwrap_or_else(|_| chrono::Duration::zero()),
                ),
            };
            status.last_error = Some(error.to_string());
        });
    }

    fn current_backoff(&self) -> Duration {
        *self.backoff.lock().unwrap()
    }
}
