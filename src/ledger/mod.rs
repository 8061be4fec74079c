//! Ledger Store - append-only double-entry bookkeeping (C1)
//!
//! Every chip movement is an append-only entry against an account
//! identified by `(user_id, currency, account_type)`. The store keeps a
//! cached balance per account, updated in the same transaction that
//! writes the entries, so `balance == Σ signed amounts` holds at every
//! quiescent point.
//!
//! Internal movements (buy-in, cash-out, refunds, hand settlement
//! between players) are double-entry: the postings of one transaction
//! sum to zero across the participating internal accounts. Kinds that
//! cross the implicit external account (deposits, withdrawals, rake) are
//! exempt from that check.
//!
//! Settlement kinds (`HAND_WIN`, `HAND_LOSS`, `RAKE`) are unique per
//! `(account, reference, kind)`: replaying a settlement transaction
//! skips postings that already exist instead of duplicating them.

pub mod memory;
pub mod pg;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core_types::{Amount, UserId};
use crate::error::CoreError;

pub use memory::MemoryLedger;
pub use pg::PgLedger;

// ============================================================
// TYPES
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountType {
    /// Chips available for buy-in / withdrawal.
    Main,
    /// Chips currently at a table.
    InPlay,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Main => "MAIN",
            AccountType::InPlay => "IN_PLAY",
        }
    }

    pub fn from_str(raw: &str) -> Option<Self> {
        match raw {
            "MAIN" => Some(AccountType::Main),
            "IN_PLAY" => Some(AccountType::InPlay),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryKind {
    BuyIn,
    CashOut,
    HandWin,
    HandLoss,
    Rake,
    Deposit,
    Withdrawal,
    Refund,
    Sweep,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::BuyIn => "BUY_IN",
            EntryKind::CashOut => "CASH_OUT",
            EntryKind::HandWin => "HAND_WIN",
            EntryKind::HandLoss => "HAND_LOSS",
            EntryKind::Rake => "RAKE",
            EntryKind::Deposit => "DEPOSIT",
            EntryKind::Withdrawal => "WITHDRAWAL",
            EntryKind::Refund => "REFUND",
            EntryKind::Sweep => "SWEEP",
        }
    }

    pub fn from_str(raw: &str) -> Option<Self> {
        match raw {
            "BUY_IN" => Some(EntryKind::BuyIn),
            "CASH_OUT" => Some(EntryKind::CashOut),
            "HAND_WIN" => Some(EntryKind::HandWin),
            "HAND_LOSS" => Some(EntryKind::HandLoss),
            "RAKE" => Some(EntryKind::Rake),
            "DEPOSIT" => Some(EntryKind::Deposit),
            "WITHDRAWAL" => Some(EntryKind::Withdrawal),
            "REFUND" => Some(EntryKind::Refund),
            "SWEEP" => Some(EntryKind::Sweep),
            _ => None,
        }
    }

    /// Kinds whose decrements the store refuses to take below zero.
    /// Settlement kinds are deliberately unguarded; the settlement worker
    /// pre-checks and skips instead.
    pub fn is_guarded(&self) -> bool {
        matches!(
            self,
            EntryKind::BuyIn | EntryKind::CashOut | EntryKind::Withdrawal
        )
    }

    /// Kinds protected by the (account, reference, kind) uniqueness rule.
    pub fn is_settlement(&self) -> bool {
        matches!(
            self,
            EntryKind::HandWin | EntryKind::HandLoss | EntryKind::Rake
        )
    }
}

/// Logical account identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountKey {
    pub user_id: UserId,
    pub currency: String,
    pub account_type: AccountType,
}

impl AccountKey {
    pub fn main(user_id: UserId, currency: &str) -> Self {
        Self {
            user_id,
            currency: currency.to_string(),
            account_type: AccountType::Main,
        }
    }

    pub fn in_play(user_id: UserId, currency: &str) -> Self {
        Self {
            user_id,
            currency: currency.to_string(),
            account_type: AccountType::InPlay,
        }
    }
}

impl std::fmt::Display for AccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.user_id,
            self.currency,
            self.account_type.as_str()
        )
    }
}

/// One signed entry to be written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Posting {
    pub account: AccountKey,
    pub amount: Amount,
    pub kind: EntryKind,
    pub reference: Option<String>,
    pub metadata: Value,
}

impl Posting {
    pub fn new(account: AccountKey, amount: Amount, kind: EntryKind) -> Self {
        Self {
            account,
            amount,
            kind,
            reference: None,
            metadata: Value::Null,
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// One stored entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub account: AccountKey,
    pub amount: Amount,
    pub kind: EntryKind,
    pub reference: Option<String>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Error, Debug, Clone)]
pub enum LedgerError {
    #[error("account missing: {0}")]
    AccountMissing(String),

    #[error("balance of {account} would go negative ({balance} {delta:+})")]
    BalanceWouldGoNegative {
        account: String,
        balance: Amount,
        delta: Amount,
    },

    #[error("ledger backend error: {0}")]
    Backend(String),
}

impl From<LedgerError> for CoreError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::AccountMissing(account) => CoreError::AccountMissing(account),
            LedgerError::BalanceWouldGoNegative { .. } => CoreError::InsufficientFunds,
            LedgerError::Backend(msg) => CoreError::Database(msg),
        }
    }
}

// ============================================================
// TRAIT
// ============================================================

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Create the account with a zero balance if it does not exist.
    async fn upsert_account(&self, key: &AccountKey) -> Result<(), LedgerError>;

    /// Atomically write a set of postings and update the cached balances.
    ///
    /// All postings apply or none do. Settlement-kind postings whose
    /// `(account, reference, kind)` already exists are skipped without
    /// failing the transaction; the returned count is the number of
    /// postings actually written.
    async fn apply_transaction(&self, postings: &[Posting]) -> Result<u32, LedgerError>;

    /// Cached balance; `AccountMissing` if the account does not exist.
    async fn balance(&self, key: &AccountKey) -> Result<Amount, LedgerError>;

    /// All entries of an account, oldest first.
    async fn entries(&self, key: &AccountKey) -> Result<Vec<LedgerEntry>, LedgerError>;

    async fn entry_exists(
        &self,
        key: &AccountKey,
        reference: &str,
        kind: EntryKind,
    ) -> Result<bool, LedgerError>;
}
