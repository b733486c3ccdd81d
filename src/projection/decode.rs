//! Projector event decoding
//!
//! Shared decrypt-and-decode path for projectors: resolve the aggregate
//! key, open the payload with its version-bound AAD, upcast, and
//! deserialize the typed event.

use std::sync::Arc;

use crate::codec::aad;
use crate::codec::envelope::UpcasterRegistry;
use crate::crypto::{CryptoError, CryptoService, KeyringManager};
use crate::domain::DomainEvent;

use super::{ProjectionError, ProjectionEventRow};

/// Decoder handed to every projector.
#[derive(Clone)]
pub struct EventDecoder {
    crypto: Arc<dyn CryptoService>,
    keyring: Arc<KeyringManager>,
    upcasters: Arc<UpcasterRegistry>,
}

impl EventDecoder {
    pub fn new(
        crypto: Arc<dyn CryptoService>,
        keyring: Arc<KeyringManager>,
        upcasters: Arc<UpcasterRegistry>,
    ) -> Self {
        Self {
            crypto,
            keyring,
            upcasters,
        }
    }

    pub fn crypto(&self) -> &Arc<dyn CryptoService> {
        &self.crypto
    }

    pub fn keyring(&self) -> &Arc<KeyringManager> {
        &self.keyring
    }

    /// Decode one event row into a typed event.
    ///
    /// Returns `None` when the event must be skipped: no key is available
    /// (logged, cursor still advances) or the event type is unknown to this
    /// projector. Authentication failures and codec errors propagate.
    pub async fn decode<E: DomainEvent>(
        &self,
        row: &ProjectionEventRow,
    ) -> Result<Option<E>, ProjectionError> {
        let key = match self
            .keyring
            .resolve_key_for_event(&row.aggregate_id, row.epoch, row.keyring_update.as_deref())
            .await
        {
            Ok(key) => key,
            Err(CryptoError::MissingKey { aggregate_id }) => {
                tracing::warn!(
                    aggregate_id = %aggregate_id,
                    event_id = %row.id,
                    "No key for event; skipping"
                );
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let plaintext = self.crypto.decrypt(
            &row.payload_encrypted,
            &key,
            &aad::event_payload(
                &row.aggregate_type,
                &row.aggregate_id,
                &row.event_type,
                row.version,
            ),
        )?;

        let data = self.upcasters.decode_payload(&row.event_type, &plaintext)?;
        match serde_json::from_value::<E>(data) {
            Ok(event) => Ok(Some(event)),
            Err(_) => {
                // Unknown event type for this projector: state unchanged.
                tracing::debug!(
                    event_type = %row.event_type,
                    event_id = %row.id,
                    "Projector does not handle event type"
                );
                Ok(None)
            }
        }
    }
}
