//! Cold persistence - write-behind durable storage (C9 targets)
//!
//! The hot store holds canonical state; this module is the log catching
//! up behind it. Losing a single persist job only extends recovery time
//! on a cold restart: the most recent persisted snapshot per table is a
//! state from which the engine can resume.

pub mod memory;
pub mod pg;
pub mod schema;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::TableConfig;
use crate::core_types::{HandId, TableId};
use crate::error::CoreError;

pub use memory::MemoryColdStore;
pub use pg::PgColdStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TableStatus {
    Waiting,
    Active,
    Closed,
}

impl TableStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableStatus::Waiting => "WAITING",
            TableStatus::Active => "ACTIVE",
            TableStatus::Closed => "CLOSED",
        }
    }

    pub fn from_str(raw: &str) -> Option<Self> {
        match raw {
            "WAITING" => Some(TableStatus::Waiting),
            "ACTIVE" => Some(TableStatus::Active),
            "CLOSED" => Some(TableStatus::Closed),
            _ => None,
        }
    }
}

/// One persisted table row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableRecord {
    pub table_id: TableId,
    pub config: TableConfig,
    /// The full versioned snapshot JSON as last persisted.
    pub state: Value,
    pub status: TableStatus,
    pub updated_at: DateTime<Utc>,
}

#[derive(Error, Debug, Clone)]
pub enum PersistError {
    #[error("cold store backend error: {0}")]
    Backend(String),
}

impl From<PersistError> for CoreError {
    fn from(e: PersistError) -> Self {
        CoreError::Database(e.to_string())
    }
}

#[async_trait]
pub trait ColdStore: Send + Sync {
    async fn upsert_table(&self, record: &TableRecord) -> Result<(), PersistError>;

    async fn set_table_status(
        &self,
        table_id: &str,
        status: TableStatus,
    ) -> Result<(), PersistError>;

    async fn load_table(&self, table_id: &str) -> Result<Option<TableRecord>, PersistError>;

    async fn insert_hand_history(
        &self,
        table_id: &str,
        hand_id: HandId,
        data: &Value,
    ) -> Result<(), PersistError>;

    async fn hand_history_count(&self, table_id: &str) -> Result<u64, PersistError>;
}
