//! In-memory ledger
//!
//! Single-process backend for tests and dev mode. One mutex over the
//! whole book makes each `apply_transaction` trivially atomic.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use super::{AccountKey, EntryKind, LedgerEntry, LedgerError, LedgerStore, Posting};
use crate::core_types::Amount;

#[derive(Default)]
struct AccountState {
    balance: Amount,
    entries: Vec<LedgerEntry>,
}

impl AccountState {
    fn has_entry(&self, reference: &str, kind: EntryKind) -> bool {
        self.entries
            .iter()
            .any(|e| e.kind == kind && e.reference.as_deref() == Some(reference))
    }
}

#[derive(Default)]
pub struct MemoryLedger {
    accounts: Mutex<HashMap<AccountKey, AccountState>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn upsert_account(&self, key: &AccountKey) -> Result<(), LedgerError> {
        let mut accounts = self.accounts.lock().unwrap();
        accounts.entry(key.clone()).or_default();
        Ok(())
    }

    async fn apply_transaction(&self, postings: &[Posting]) -> Result<u32, LedgerError> {
        let mut accounts = self.accounts.lock().unwrap();

        // Validation pass: every account must exist, no guarded balance may
        // go negative, duplicate settlement postings are marked for skip.
        let mut projected: HashMap<&AccountKey, Amount> = HashMap::new();
        let mut skip = vec![false; postings.len()];
        for (idx, posting) in postings.iter().enumerate() {
            let state = accounts
                .get(&posting.account)
                .ok_or_else(|| LedgerError::AccountMissing(posting.account.to_string()))?;
            if posting.kind.is_settlement()
                && let Some(reference) = &posting.reference
                && state.has_entry(reference, posting.kind)
            {
                skip[idx] = true;
                continue;
            }
            let balance = projected
                .entry(&posting.account)
                .or_insert(state.balance);
            let next = *balance + posting.amount;
            if posting.kind.is_guarded() && next < 0 {
                return Err(LedgerError::BalanceWouldGoNegative {
                    account: posting.account.to_string(),
                    balance: *balance,
                    delta: posting.amount,
                });
            }
            *balance = next;
        }

        // Commit pass.
        let now = Utc::now();
        let mut applied = 0;
        for (idx, posting) in postings.iter().enumerate() {
            if skip[idx] {
                continue;
            }
            let state = accounts.get_mut(&posting.account).unwrap();
            state.balance += posting.amount;
            state.entries.push(LedgerEntry {
                account: posting.account.clone(),
                amount: posting.amount,
                kind: posting.kind,
                reference: posting.reference.clone(),
                metadata: posting.metadata.clone(),
                created_at: now,
            });
            applied += 1;
        }
        Ok(applied)
    }

    async fn balance(&self, key: &AccountKey) -> Result<Amount, LedgerError> {
        let accounts = self.accounts.lock().unwrap();
        accounts
            .get(key)
            .map(|s| s.balance)
            .ok_or_else(|| LedgerError::AccountMissing(key.to_string()))
    }

    async fn entries(&self, key: &AccountKey) -> Result<Vec<LedgerEntry>, LedgerError> {
        let accounts = self.accounts.lock().unwrap();
        accounts
            .get(key)
            .map(|s| s.entries.clone())
            .ok_or_else(|| LedgerError::AccountMissing(key.to_string()))
    }

    async fn entry_exists(
        &self,
        key: &AccountKey,
        reference: &str,
        kind: EntryKind,
    ) -> Result<bool, LedgerError> {
        let accounts = self.accounts.lock().unwrap();
        Ok(accounts
            .get(key)
            .map(|s| s.has_entry(reference, kind))
            .unwrap_or(false))
    }
}
