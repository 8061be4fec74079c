//! State Store - versioned per-table snapshots (C2)
//!
//! The canonical table state lives here: one snapshot per table with a
//! strictly increasing `version` counter, replaced only through
//! `compare_and_set`, plus a best-effort pub/sub channel per table and a
//! small TTL'd KV surface used by the idempotency layer.
//!
//! Backends: [`memory::MemoryStateStore`] (tests, single-node dev) and
//! [`redis::RedisStateStore`] (production, Lua-scripted CAS).

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core_types::{TableId, Version};
use crate::error::CoreError;

pub use self::memory::MemoryStateStore;
pub use self::redis::RedisStateStore;

/// Key of a table snapshot in the hot store.
pub fn table_key(table_id: &str) -> String {
    format!("table:{}", table_id)
}

/// Name of a table's pub/sub channel.
pub fn table_channel(table_id: &str) -> String {
    format!("table:{}", table_id)
}

// ============================================================
// TYPES
// ============================================================

/// A versioned engine snapshot. The engine state is opaque to the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSnapshot {
    #[serde(rename = "_version")]
    pub version: Version,
    pub state: Value,
}

impl TableSnapshot {
    pub fn new(version: Version, state: Value) -> Self {
        Self { version, state }
    }
}

/// Event published on a table channel. Carries only the version;
/// subscribers re-read canonical state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateEvent {
    StateUpdate { table_id: TableId, version: Version },
}

#[derive(Error, Debug, Clone)]
pub enum StateError {
    #[error("no snapshot stored for table {0}")]
    NotFound(String),

    #[error("version mismatch on {table_id}: expected {expected}")]
    VersionMismatch { table_id: String, expected: Version },

    #[error("snapshot for {0} already exists")]
    AlreadyExists(String),

    #[error("state store backend error: {0}")]
    Backend(String),
}

impl From<StateError> for CoreError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::NotFound(table_id) => CoreError::TableNotFound(table_id),
            StateError::VersionMismatch { expected, .. } => {
                CoreError::ConcurrentModification { expected }
            }
            StateError::AlreadyExists(table_id) => {
                CoreError::Internal(format!("table {} already exists", table_id))
            }
            StateError::Backend(msg) => CoreError::Store(msg),
        }
    }
}

// ============================================================
// TRAITS
// ============================================================

/// A live pattern subscription over every table channel.
#[async_trait]
pub trait EventSubscription: Send {
    /// Next event; `None` when the subscription is closed.
    async fn recv(&mut self) -> Option<StateEvent>;
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, table_id: &str) -> Result<Option<TableSnapshot>, StateError>;

    /// Atomically replace the snapshot.
    ///
    /// `expected_version = None` creates the initial snapshot and fails
    /// with `AlreadyExists` if one is present. `Some(v)` verifies the
    /// stored version equals `v` (`VersionMismatch` otherwise, `NotFound`
    /// if no snapshot exists) and replaces the whole value. The TTL is
    /// refreshed on every write.
    async fn compare_and_set(
        &self,
        table_id: &str,
        expected_version: Option<Version>,
        snapshot: &TableSnapshot,
        ttl: Duration,
    ) -> Result<(), StateError>;

    /// Best-effort publish on the table channel; loss is tolerated.
    async fn publish(&self, table_id: &str, event: &StateEvent) -> Result<(), StateError>;

    /// One pattern subscription over all table channels (`table:*`).
    async fn subscribe_all(&self) -> Result<Box<dyn EventSubscription>, StateError>;

    // --- generic TTL'd KV (idempotency keys) ---

    async fn kv_get(&self, key: &str) -> Result<Option<String>, StateError>;

    async fn kv_set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StateError>;

    /// Set only if absent; returns whether the key was claimed.
    async fn kv_set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StateError>;

    async fn kv_del(&self, key: &str) -> Result<(), StateError>;
}
