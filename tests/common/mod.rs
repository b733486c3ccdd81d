//! Shared test fixtures: a fully-wired client store over any transport.

#![allow(dead_code)]

use std::sync::Arc;

use momentum_local::codec::envelope::UpcasterRegistry;
use momentum_local::crypto::{
    ChaChaBoxCrypto, CryptoService, KeyringManager, SecretKey, SqliteKeyStore,
};
use momentum_local::domain::{Goal, Project};
use momentum_local::event_store::{
    EventAppender, IdempotencyStore, Repository, SnapshotStore,
};
use momentum_local::handlers::{GoalCommandHandler, ProjectCommandHandler};
use momentum_local::projection::EventDecoder;
use momentum_local::sync::{SyncEngine, SyncEventMapStore, SyncMetaStore, SyncTransport};
use momentum_local::{Config, LocalDb};

/// A wired-up client store for integration tests.
pub struct TestClient {
    pub db: LocalDb,
    pub crypto: Arc<dyn CryptoService>,
    pub keyring: Arc<KeyringManager>,
    pub upcasters: Arc<UpcasterRegistry>,
    pub decoder: EventDecoder,
    pub goals: Arc<GoalCommandHandler>,
    pub projects: Arc<ProjectCommandHandler>,
    pub engine: Arc<SyncEngine>,
    pub map: SyncEventMapStore,
    pub meta: SyncMetaStore,
    pub store_id: String,
}

impl TestClient {
    pub fn goal_repository(&self) -> Repository<Goal> {
        Repository::new(
            EventAppender::new(self.db.clone()),
            SnapshotStore::new(self.db.clone()),
            self.crypto.clone(),
            self.keyring.clone(),
            self.upcasters.clone(),
        )
    }

    pub fn project_repository(&self) -> Repository<Project> {
        Repository::new(
            EventAppender::new(self.db.clone()),
            SnapshotStore::new(self.db.clone()),
            self.crypto.clone(),
            self.keyring.clone(),
            self.upcasters.clone(),
        )
    }
}

/// The user-level master key; provisioning it across devices belongs to the
/// vault, so tests just share one.
pub fn master_key() -> SecretKey {
    ChaChaBoxCrypto::new().generate_key()
}

pub async fn client(
    store_id: &str,
    transport: Arc<dyn SyncTransport>,
    master_key: SecretKey,
) -> TestClient {
    let db = LocalDb::connect("sqlite::memory:").await.unwrap();
    let crypto: Arc<dyn CryptoService> = Arc::new(ChaChaBoxCrypto::new());
    let key_store = Arc::new(SqliteKeyStore::new(
        db.pool().clone(),
        crypto.clone(),
        master_key.clone(),
    ));
    let keyring = Arc::new(KeyringManager::new(
        key_store,
        crypto.clone(),
        master_key.clone(),
    ));
    let upcasters = Arc::new(UpcasterRegistry::new());
    let decoder = EventDecoder::new(crypto.clone(), keyring.clone(), upcasters.clone());

    let goals = Arc::new(GoalCommandHandler::new(
        Repository::new(
            EventAppender::new(db.clone()),
            SnapshotStore::new(db.clone()),
            crypto.clone(),
            keyring.clone(),
            upcasters.clone(),
        ),
        IdempotencyStore::new(db.clone()),
    ));
    let projects = Arc::new(ProjectCommandHandler::new(
        Repository::new(
            EventAppender::new(db.clone()),
            SnapshotStore::new(db.clone()),
            crypto.clone(),
            keyring.clone(),
            upcasters.clone(),
        ),
        IdempotencyStore::new(db.clone()),
    ));

    let engine = Arc::new(SyncEngine::new(
        db.clone(),
        transport,
        crypto.clone(),
        keyring.clone(),
        Config::for_store(store_id),
    ));

    TestClient {
        map: SyncEventMapStore::new(db.clone()),
        meta: SyncMetaStore::new(db.clone()),
        db,
        crypto,
        keyring,
        upcasters,
        decoder,
        goals,
        projects,
        engine,
        store_id: store_id.to_string(),
    }
}
