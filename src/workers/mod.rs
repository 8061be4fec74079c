//! Deferred worker pipeline (C6-C9)
//!
//! Every hand completion and every scheduled timer flows through the job
//! queue into these handlers. Handlers are idempotent: delivery is
//! at-least-once, and the timeout / next-hand handlers additionally
//! self-cancel against the snapshot version so a stale timer can never
//! act on newer state.

pub mod archive;
pub mod blind_level;
pub mod next_hand;
pub mod persist;
pub mod settlement;
pub mod timeout;

use serde::{Deserialize, Serialize};

use crate::config::TableConfig;
use crate::core_types::{Amount, HandId, SeatIdx, TableId, UserId, Version};
use crate::persistence::TableStatus;
use crate::store::TableSnapshot;

pub use archive::ArchiveWorker;
pub use blind_level::BlindLevelWorker;
pub use next_hand::NextHandWorker;
pub use persist::PersistWorker;
pub use settlement::SettlementWorker;
pub use timeout::TimeoutWorker;

// ============================================================
// JOB PAYLOADS
// ============================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistSnapshotJob {
    pub table_id: TableId,
    pub status: TableStatus,
    pub config: TableConfig,
    pub snapshot: TableSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerDelta {
    pub user_id: UserId,
    pub delta: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettleHandJob {
    pub table_id: TableId,
    pub hand_id: HandId,
    pub deltas: Vec<PlayerDelta>,
    pub rake_total: Amount,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveHandJob {
    pub table_id: TableId,
    pub hand_id: HandId,
    pub snapshot: TableSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextHandJob {
    pub table_id: TableId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerTimeoutJob {
    pub table_id: TableId,
    pub player_id: UserId,
    pub seat: SeatIdx,
    pub expected_version: Version,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlindLevelJob {
    pub table_id: TableId,
}

/// Ledger reference string for a hand's settlement entries.
pub fn hand_reference(hand_id: HandId) -> String {
    format!("hand:{}", hand_id)
}
