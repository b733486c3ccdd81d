//! Keyring manager
//!
//! Resolves the data key for an event, honoring keyring-update envelopes
//! piggybacked on the event stream, and mints the initial update for new
//! aggregates.

use std::sync::Arc;

use crate::codec::aad;

use super::{CryptoError, CryptoService, KeyStore, SecretKey};

/// Epoch assigned to a freshly-created aggregate key
pub const INITIAL_EPOCH: i64 = 1;

/// The key resolved for an aggregate, plus the keyring-update envelope to
/// attach to the first event if the key is new.
pub struct ResolvedKey {
    pub key: SecretKey,
    pub epoch: i64,
    pub initial_update: Option<Vec<u8>>,
}

/// Key resolution for the event streams.
pub struct KeyringManager {
    key_store: Arc<dyn KeyStore>,
    crypto: Arc<dyn CryptoService>,
    master_key: SecretKey,
}

impl KeyringManager {
    pub fn new(
        key_store: Arc<dyn KeyStore>,
        crypto: Arc<dyn CryptoService>,
        master_key: SecretKey,
    ) -> Self {
        Self {
            key_store,
            crypto,
            master_key,
        }
    }

    /// Resolve the decryption key for an event.
    ///
    /// A `keyring_update` envelope carried by the event takes precedence: it
    /// is unwrapped, persisted, and returned. Otherwise the stored key is
    /// used. Absence of both is [`CryptoError::MissingKey`].
    pub async fn resolve_key_for_event(
        &self,
        aggregate_id: &str,
        epoch: Option<i64>,
        keyring_update: Option<&[u8]>,
    ) -> Result<SecretKey, CryptoError> {
        if let Some(envelope) = keyring_update {
            let epoch = epoch.unwrap_or(INITIAL_EPOCH);
            let key_bytes = self.crypto.decrypt(
                envelope,
                &self.master_key,
                &aad::keyring_update(aggregate_id, epoch),
            )?;
            let key = SecretKey::from_slice(&key_bytes)?;

            self.key_store
                .save_aggregate_key(aggregate_id, &key, epoch)
                .await?;

            tracing::debug!(
                aggregate_id = %aggregate_id,
                epoch = epoch,
                fingerprint = %key.fingerprint(),
                "Applied keyring update"
            );

            return Ok(key);
        }

        let stored = self
            .key_store
            .get_aggregate_key(aggregate_id)
            .await?
            .ok_or_else(|| CryptoError::MissingKey {
                aggregate_id: aggregate_id.to_string(),
            })?;

        if let Some(event_epoch) = epoch {
            if event_epoch != stored.epoch {
                tracing::warn!(
                    aggregate_id = %aggregate_id,
                    event_epoch = event_epoch,
                    stored_epoch = stored.epoch,
                    "Event epoch differs from stored key epoch"
                );
            }
        }

        Ok(stored.key)
    }

    /// Build the keyring-update envelope announcing `key` for a new
    /// aggregate.
    pub fn create_initial_update(
        &self,
        aggregate_id: &str,
        key: &SecretKey,
    ) -> Result<Vec<u8>, CryptoError> {
        self.crypto.encrypt(
            key.as_bytes(),
            &self.master_key,
            &aad::keyring_update(aggregate_id, INITIAL_EPOCH),
        )
    }

    /// Fetch or mint the encryption key for an aggregate.
    ///
    /// A freshly-minted key comes back with the envelope the caller must
    /// attach to the aggregate's next appended event.
    pub async fn ensure_aggregate_key(&self, aggregate_id: &str) -> Result<ResolvedKey, CryptoError> {
        if let Some(stored) = self.key_store.get_aggregate_key(aggregate_id).await? {
            return Ok(ResolvedKey {
                key: stored.key,
                epoch: stored.epoch,
                initial_update: None,
            });
        }

        let key = self.crypto.generate_key();
        let envelope = self.create_initial_update(aggregate_id, &key)?;
        self.key_store
            .save_aggregate_key(aggregate_id, &key, INITIAL_EPOCH)
            .await?;

        tracing::debug!(
            aggregate_id = %aggregate_id,
            fingerprint = %key.fingerprint(),
            "Minted aggregate key"
        );

        Ok(ResolvedKey {
            key,
            epoch: INITIAL_EPOCH,
            initial_update: Some(envelope),
        })
    }

    /// Current keyring epoch for an aggregate, if a key exists.
    pub async fn current_epoch(&self, aggregate_id: &str) -> Result<Option<i64>, CryptoError> {
        Ok(self
            .key_store
            .get_aggregate_key(aggregate_id)
            .await?
            .map(|stored| stored.epoch))
    }
}
