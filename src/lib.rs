//! momentum-local
//!
//! Local-first encrypted event store and bidirectional sync engine for the
//! Momentum productivity system. Events are AEAD-encrypted at rest, derived
//! state (snapshots, analytics, search indices) is maintained by a
//! projection runtime, and a background sync engine reconciles the local
//! log against the server-assigned global order.

pub mod codec;
pub mod crypto;
pub mod db;
pub mod domain;
pub mod event_store;
pub mod handlers;
pub mod jobs;
pub mod projection;
pub mod saga;
pub mod sync;

pub mod config;
mod error;

pub use config::Config;
pub use db::LocalDb;
pub use error::{AppError, AppResult, FieldReason};
pub use projection::EffectiveCursor;
pub use sync::SyncStatus;
