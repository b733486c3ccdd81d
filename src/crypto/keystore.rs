//! Aggregate key store
//!
//! Per-aggregate data keys, wrapped under the store master key before they
//! touch disk.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::codec::aad;

use super::{CryptoError, CryptoService, SecretKey};

/// A key resolved from the store, with the epoch it was written at.
#[derive(Debug, Clone)]
pub struct StoredKey {
    pub key: SecretKey,
    pub epoch: i64,
}

/// Storage port for per-aggregate keys.
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn get_aggregate_key(&self, aggregate_id: &str)
        -> Result<Option<StoredKey>, CryptoError>;

    async fn save_aggregate_key(
        &self,
        aggregate_id: &str,
        key: &SecretKey,
        epoch: i64,
    ) -> Result<(), CryptoError>;
}

/// SQLite-backed [`KeyStore`]. Key bytes are AEAD-wrapped under the master
/// key with an AAD binding the aggregate id and epoch.
pub struct SqliteKeyStore {
    pool: SqlitePool,
    crypto: Arc<dyn CryptoService>,
    master_key: SecretKey,
}

impl SqliteKeyStore {
    pub fn new(pool: SqlitePool, crypto: Arc<dyn CryptoService>, master_key: SecretKey) -> Self {
        Self {
            pool,
            crypto,
            master_key,
        }
    }
}

#[async_trait]
impl KeyStore for SqliteKeyStore {
    async fn get_aggregate_key(
        &self,
        aggregate_id: &str,
    ) -> Result<Option<StoredKey>, CryptoError> {
        let row: Option<(Vec<u8>, i64)> = sqlx::query_as(
            r#"
            SELECT key_wrapped, epoch FROM aggregate_keys WHERE aggregate_id = ?1
            "#,
        )
        .bind(aggregate_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CryptoError::Store(e.to_string()))?;

        let Some((wrapped, epoch)) = row else {
            return Ok(None);
        };

        let unwrapped = self.crypto.decrypt(
            &wrapped,
            &self.master_key,
            &aad::aggregate_key(aggregate_id, epoch),
        )?;

        Ok(Some(StoredKey {
            key: SecretKey::from_slice(&unwrapped)?,
            epoch,
        }))
    }

    async fn save_aggregate_key(
        &self,
        aggregate_id: &str,
        key: &SecretKey,
        epoch: i64,
    ) -> Result<(), CryptoError> {
        let wrapped = self.crypto.encrypt(
            key.as_bytes(),
            &self.master_key,
            &aad::aggregate_key(aggregate_id, epoch),
        )?;

        sqlx::query(
            r#"
            INSERT INTO aggregate_keys (aggregate_id, key_wrapped, epoch, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (aggregate_id)
            DO UPDATE SET key_wrapped = ?2, epoch = ?3, updated_at = ?4
            "#,
        )
        .bind(aggregate_id)
        .bind(wrapped)
        .bind(epoch)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| CryptoError::Store(e.to_string()))?;

        tracing::debug!(
            aggregate_id = %aggregate_id,
            epoch = epoch,
            fingerprint = %key.fingerprint(),
            "Saved aggregate key"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ChaChaBoxCrypto;
    use crate::db::LocalDb;

    async fn store() -> SqliteKeyStore {
        let db = LocalDb::connect("sqlite::memory:").await.unwrap();
        let crypto: Arc<dyn CryptoService> = Arc::new(ChaChaBoxCrypto::new());
        let master_key = crypto.generate_key();
        SqliteKeyStore::new(db.pool().clone(), crypto, master_key)
    }

    #[tokio::test]
    async fn test_save_and_get_round_trip() {
        let store = store().await;
        let key = ChaChaBoxCrypto::new().generate_key();

        store.save_aggregate_key("goal-1", &key, 1).await.unwrap();
        let loaded = store.get_aggregate_key("goal-1").await.unwrap().unwrap();

        assert_eq!(loaded.key, key);
        assert_eq!(loaded.epoch, 1);
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let store = store().await;
        assert!(store.get_aggregate_key("goal-9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_replaces_key_at_new_epoch() {
        let store = store().await;
        let crypto = ChaChaBoxCrypto::new();
        let first = crypto.generate_key();
        let second = crypto.generate_key();

        store.save_aggregate_key("goal-1", &first, 1).await.unwrap();
        store.save_aggregate_key("goal-1", &second, 2).await.unwrap();

        let loaded = store.get_aggregate_key("goal-1").await.unwrap().unwrap();
        assert_eq!(loaded.key, second);
        assert_eq!(loaded.epoch, 2);
    }
}
