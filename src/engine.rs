//! Rules-engine contract
//!
//! The poker rules engine (hand evaluation, street progression, side pot
//! math) is an external collaborator. The core consumes it through this
//! opaque structural contract: it restores an engine from a snapshot,
//! applies one action, and reads back a status projection plus a new
//! snapshot. The engine state itself is an opaque JSON value the core
//! never interprets.
//!
//! The engine is authoritative for poker-rules validity; rejections carry
//! a stable code that is forwarded to the caller unchanged.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::TableConfig;
use crate::core_types::{Amount, SeatIdx, TableId, UserId, Version};
use crate::error::CoreError;
use crate::store::TableSnapshot;

// ============================================================
// ACTIONS
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    Sit,
    Stand,
    AddChips,
    ReserveSeat,
    Deal,
    Fold,
    Check,
    Call,
    Bet,
    Raise,
    Show,
    Muck,
    TimeBank,
    Timeout,
    NextBlindLevel,
}

/// One table action as submitted by a player or by the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: ActionType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player_id: Option<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seat: Option<SeatIdx>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<Amount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<Amount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub card_indices: Option<Vec<u8>>,
}

impl Action {
    pub fn new(kind: ActionType) -> Self {
        Self {
            kind,
            player_id: None,
            seat: None,
            amount: None,
            stack: None,
            card_indices: None,
        }
    }

    pub fn sit(player_id: UserId, seat: SeatIdx, stack: Amount) -> Self {
        Self {
            player_id: Some(player_id),
            seat: Some(seat),
            stack: Some(stack),
            ..Self::new(ActionType::Sit)
        }
    }

    pub fn stand(player_id: UserId) -> Self {
        Self {
            player_id: Some(player_id),
            ..Self::new(ActionType::Stand)
        }
    }

    pub fn add_chips(player_id: UserId, amount: Amount) -> Self {
        Self {
            player_id: Some(player_id),
            amount: Some(amount),
            ..Self::new(ActionType::AddChips)
        }
    }

    pub fn deal() -> Self {
        Self::new(ActionType::Deal)
    }

    pub fn fold(player_id: UserId) -> Self {
        Self {
            player_id: Some(player_id),
            ..Self::new(ActionType::Fold)
        }
    }

    pub fn check(player_id: UserId) -> Self {
        Self {
            player_id: Some(player_id),
            ..Self::new(ActionType::Check)
        }
    }

    pub fn call(player_id: UserId) -> Self {
        Self {
            player_id: Some(player_id),
            ..Self::new(ActionType::Call)
        }
    }

    pub fn bet(player_id: UserId, amount: Amount) -> Self {
        Self {
            player_id: Some(player_id),
            amount: Some(amount),
            ..Self::new(ActionType::Bet)
        }
    }

    pub fn raise(player_id: UserId, amount: Amount) -> Self {
        Self {
            player_id: Some(player_id),
            amount: Some(amount),
            ..Self::new(ActionType::Raise)
        }
    }

    pub fn show(player_id: UserId) -> Self {
        Self {
            player_id: Some(player_id),
            ..Self::new(ActionType::Show)
        }
    }

    pub fn muck(player_id: UserId) -> Self {
        Self {
            player_id: Some(player_id),
            ..Self::new(ActionType::Muck)
        }
    }

    pub fn time_bank(player_id: UserId) -> Self {
        Self {
            player_id: Some(player_id),
            ..Self::new(ActionType::TimeBank)
        }
    }

    pub fn timeout(player_id: UserId) -> Self {
        Self {
            player_id: Some(player_id),
            ..Self::new(ActionType::Timeout)
        }
    }

    pub fn next_blind_level() -> Self {
        Self::new(ActionType::NextBlindLevel)
    }
}

// ============================================================
// STATUS PROJECTION
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Street {
    /// No hand in progress (table just created, or between hands).
    Waiting,
    Preflop,
    Flop,
    Turn,
    River,
    Showdown,
}

/// One seated player as revealed by the engine status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub user_id: UserId,
    pub seat: SeatIdx,
    pub stack: Amount,
    pub folded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WinnerInfo {
    pub user_id: UserId,
    pub seat: SeatIdx,
    pub amount: Amount,
}

/// The projection of engine state the orchestrator is allowed to read.
///
/// `winners` being non-null signals hand completion; `rake_this_hand` is
/// only meaningful in that case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub players: Vec<PlayerInfo>,
    pub street: Street,
    pub action_to: Option<SeatIdx>,
    pub winners: Option<Vec<WinnerInfo>>,
    pub rake_this_hand: Amount,
    pub config: TableConfig,
    pub time_bank_active_seat: Option<SeatIdx>,
}

impl EngineStatus {
    pub fn hand_complete(&self) -> bool {
        self.winners.is_some()
    }

    pub fn player_at(&self, seat: SeatIdx) -> Option<&PlayerInfo> {
        self.players.iter().find(|p| p.seat == seat)
    }

    pub fn players_with_chips(&self) -> usize {
        self.players.iter().filter(|p| p.stack > 0).count()
    }
}

/// Masked projection returned to callers; other players' hole cards are
/// redacted by the engine's `view`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaskedView {
    pub table_id: TableId,
    pub version: Version,
    pub state: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryFormat {
    Json,
}

// ============================================================
// ENGINE TRAITS
// ============================================================

#[derive(Error, Debug, Clone)]
pub enum EngineError {
    /// The action is invalid under poker rules; `code` is stable.
    #[error("invalid action ({code}): {message}")]
    Invalid { code: String, message: String },

    /// The snapshot could not be restored into an engine.
    #[error("corrupt engine state: {0}")]
    Corrupt(String),
}

impl EngineError {
    pub fn invalid(code: &str, message: impl Into<String>) -> Self {
        EngineError::Invalid {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl From<EngineError> for CoreError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Invalid { code, message } => CoreError::EngineInvalid { code, message },
            EngineError::Corrupt(msg) => CoreError::EngineCorrupt(msg),
        }
    }
}

/// A live engine for one table, restored from a snapshot.
pub trait Engine: Send + Sync {
    /// Apply one action. The engine mutates its own state; the core reads
    /// the result through `status` and `snapshot`.
    fn act(&mut self, action: &Action) -> Result<(), EngineError>;

    fn status(&self) -> EngineStatus;

    /// Serialize the full engine state (unmasked) for storage.
    fn snapshot(&self) -> Result<Value, EngineError>;

    /// Projection for a viewer; redacts hole cards the viewer is not
    /// entitled to see. `None` is an observer with no seat.
    fn view(&self, viewer: Option<UserId>) -> Value;

    /// Hand history export for archival.
    fn history(&self, format: HistoryFormat) -> Value;
}

pub trait EngineFactory: Send + Sync {
    fn create(&self, config: &TableConfig) -> Result<Box<dyn Engine>, EngineError>;
    fn restore(&self, snapshot: &TableSnapshot) -> Result<Box<dyn Engine>, EngineError>;
}
