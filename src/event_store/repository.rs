//! Aggregate repository
//!
//! Load: snapshot plus tail events, decrypted through the keyring.
//! Save: encrypt pending events with version-bound AAD, append, refresh the
//! snapshot. Everything except concurrency conflicts surfaces as a
//! persistence failure.

use std::marker::PhantomData;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::codec::envelope::{SnapshotEnvelope, UpcasterRegistry};
use crate::codec::aad;
use crate::crypto::{CryptoService, KeyringManager};
use crate::domain::{Aggregate, DomainEvent, EventContext};
use crate::projection::EffectiveCursor;

use super::{
    EventAppender, EventStoreError, NewEncryptedEvent, SnapshotRecord, SnapshotStore,
    StoredEventRow,
};

/// Repository for one aggregate type.
pub struct Repository<A: Aggregate> {
    appender: EventAppender,
    snapshots: SnapshotStore,
    crypto: Arc<dyn CryptoService>,
    keyring: Arc<KeyringManager>,
    upcasters: Arc<UpcasterRegistry>,
    _aggregate: PhantomData<A>,
}

impl<A: Aggregate> Repository<A> {
    pub fn new(
        appender: EventAppender,
        snapshots: SnapshotStore,
        crypto: Arc<dyn CryptoService>,
        keyring: Arc<KeyringManager>,
        upcasters: Arc<UpcasterRegistry>,
    ) -> Self {
        Self {
            appender,
            snapshots,
            crypto,
            keyring,
            upcasters,
            _aggregate: PhantomData,
        }
    }

    /// Load an aggregate by replaying its snapshot plus tail events.
    ///
    /// A snapshot that fails AEAD authentication is purged and the load
    /// falls back to a full replay; any other failure propagates.
    pub async fn load(&self, aggregate_id: &str) -> Result<Option<A>, EventStoreError> {
        let aggregate_type = A::aggregate_type().as_str();

        let (mut state, from_version) = match self.load_snapshot(aggregate_id).await? {
            Some((state, version)) => (Some(state), version),
            None => (None, 0),
        };

        let tail = self
            .appender
            .events_after_version(aggregate_type, aggregate_id, from_version)
            .await?;

        if state.is_none() && tail.is_empty() {
            return Ok(None);
        }

        let mut aggregate = state.take().unwrap_or_default();
        for row in tail {
            let key = self
                .keyring
                .resolve_key_for_event(aggregate_id, row.epoch, row.keyring_update.as_deref())
                .await?;

            let plaintext = self.crypto.decrypt(
                &row.payload_encrypted,
                &key,
                &aad::event_payload(aggregate_type, aggregate_id, &row.event_type, row.version),
            )?;

            let data = self.upcasters.decode_payload(&row.event_type, &plaintext)?;
            match serde_json::from_value::<A::Event>(data) {
                Ok(event) => aggregate = aggregate.apply(event),
                Err(e) => {
                    // Unknown event type: state passes through unchanged.
                    tracing::warn!(
                        aggregate_id = %aggregate_id,
                        event_type = %row.event_type,
                        error = %e,
                        "Skipping undecodable event during replay"
                    );
                }
            }
        }

        Ok(Some(aggregate))
    }

    async fn load_snapshot(&self, aggregate_id: &str) -> Result<Option<(A, i64)>, EventStoreError> {
        let aggregate_type = A::aggregate_type().as_str();

        let Some(record) = self.snapshots.get(aggregate_type, aggregate_id).await? else {
            return Ok(None);
        };

        let key = self
            .keyring
            .resolve_key_for_event(aggregate_id, None, None)
            .await?;

        let plaintext = match self.crypto.decrypt(
            &record.snapshot_encrypted,
            &key,
            &aad::snapshot(aggregate_id, record.snapshot_version),
        ) {
            Ok(bytes) => bytes,
            Err(e) if e.is_auth_failure() => {
                tracing::warn!(
                    aggregate_id = %aggregate_id,
                    snapshot_version = record.snapshot_version,
                    "Snapshot failed authentication; purging and replaying from scratch"
                );
                self.snapshots.purge(aggregate_type, aggregate_id).await?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let envelope = SnapshotEnvelope::decode(&plaintext)?;
        let state: A = serde_json::from_value(envelope.state)
            .map_err(crate::codec::CodecError::Serialization)?;
        Ok(Some((state, record.snapshot_version)))
    }

    /// Persist pending events and refresh the snapshot.
    ///
    /// `aggregate` is the state the events were decided against; the
    /// returned state has them applied.
    pub async fn save(
        &self,
        aggregate: A,
        events: Vec<A::Event>,
        known_version: Option<i64>,
        context: &EventContext,
    ) -> Result<(A, Vec<StoredEventRow>), EventStoreError> {
        if events.is_empty() {
            return Ok((aggregate, Vec::new()));
        }

        let aggregate_type = A::aggregate_type().as_str();
        let aggregate_id = aggregate.id().to_string();

        let resolved = self
            .keyring
            .ensure_aggregate_key(&aggregate_id)
            .await
            .map_err(|e| EventStoreError::from(e).into_persistence())?;

        let max_event_version = self
            .appender
            .max_version(aggregate_type, &aggregate_id)
            .await?;
        let snapshot_version = self
            .snapshots
            .get(aggregate_type, &aggregate_id)
            .await?
            .map(|s| s.snapshot_version)
            .unwrap_or(0);
        let start_version = max_event_version.max(snapshot_version) + 1;

        let occurred_at = Utc::now().timestamp_millis();
        let mut initial_update = resolved.initial_update;

        let mut encrypted = Vec::with_capacity(events.len());
        for (i, event) in events.iter().enumerate() {
            let version = start_version + i as i64;
            let event_type = event.event_type();

            let data = serde_json::to_value(event)
                .map_err(crate::codec::CodecError::Serialization)?;
            let payload = self
                .upcasters
                .encode_payload(event_type, data)
                .map_err(|e| EventStoreError::from(e).into_persistence())?;

            let ciphertext = self
                .crypto
                .encrypt(
                    &payload,
                    &resolved.key,
                    &aad::event_payload(aggregate_type, &aggregate_id, event_type, version),
                )
                .map_err(|e| EventStoreError::from(e).into_persistence())?;

            encrypted.push(NewEncryptedEvent {
                event_id: Uuid::new_v4().to_string(),
                event_type: event_type.to_string(),
                payload_encrypted: ciphertext,
                keyring_update: initial_update.take(),
                version,
                occurred_at,
                actor_id: context.actor_id.clone(),
                causation_id: context.causation_id.clone(),
                correlation_id: context.correlation_id.clone(),
                epoch: Some(resolved.epoch),
            });
        }

        let appended = self
            .appender
            .append_for_aggregate(aggregate_type, &aggregate_id, known_version, encrypted)
            .await?;

        let mut state = aggregate;
        for event in events {
            state = state.apply(event);
        }

        self.write_snapshot(&state, &appended)
            .await
            .map_err(|e| e.into_persistence())?;

        Ok((state, appended))
    }

    async fn write_snapshot(
        &self,
        state: &A,
        appended: &[StoredEventRow],
    ) -> Result<(), EventStoreError> {
        let aggregate_type = A::aggregate_type().as_str();
        let aggregate_id = state.id().to_string();
        let snapshot_version = appended.last().map(|r| r.version).unwrap_or(0);

        let key = self
            .keyring
            .resolve_key_for_event(&aggregate_id, None, None)
            .await?;

        let envelope = SnapshotEnvelope::latest(
            serde_json::to_value(state).map_err(crate::codec::CodecError::Serialization)?,
        );
        let ciphertext = self.crypto.encrypt(
            &envelope.encode()?,
            &key,
            &aad::snapshot(&aggregate_id, snapshot_version),
        )?;

        // Fresh local appends are pending, so the cursor trails in the
        // pending component.
        let cursor = EffectiveCursor::new(0, appended.last().map(|r| r.commit_sequence).unwrap_or(0));

        self.snapshots
            .put(&SnapshotRecord {
                aggregate_type: aggregate_type.to_string(),
                aggregate_id,
                snapshot_version,
                snapshot_encrypted: ciphertext,
                last_effective_cursor: cursor,
                written_at: Utc::now(),
            })
            .await
    }
}
