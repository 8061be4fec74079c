//! Financial Manager (C11)
//!
//! Double-entry movement of chips between a user's MAIN and IN_PLAY
//! accounts. A buy-in debits MAIN and credits IN_PLAY in one ledger
//! transaction; cash-out is symmetric. The chained buy-in + SIT path is
//! guarded by a client-supplied idempotency key: replays return the
//! cached result, concurrent attempts are rejected, and a SIT failure
//! after the ledger write is compensated with a REFUND pair.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

use crate::config::OrchestratorConfig;
use crate::core_types::{Amount, SeatIdx, UserId};
use crate::engine::{Action, MaskedView};
use crate::error::CoreError;
use crate::ledger::{AccountKey, EntryKind, LedgerError, LedgerStore, Posting};
use crate::orchestrator::{Actor, Orchestrator};
use crate::persistence::ColdStore;
use crate::store::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserBalances {
    pub main: Amount,
    pub in_play: Amount,
}

pub struct FinancialManager {
    ledger: Arc<dyn LedgerStore>,
    state: Arc<dyn StateStore>,
    cold: Arc<dyn ColdStore>,
    orchestrator: Arc<Orchestrator>,
    config: OrchestratorConfig,
}

impl FinancialManager {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        state: Arc<dyn StateStore>,
        cold: Arc<dyn ColdStore>,
        orchestrator: Arc<Orchestrator>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            ledger,
            state,
            cold,
            orchestrator,
            config,
        }
    }

    /// Currency of a table, from its persisted record.
    async fn table_currency(&self, table_id: &str) -> Result<String, CoreError> {
        let record = self
            .cold
            .load_table(table_id)
            .await?
            .ok_or_else(|| CoreError::TableNotFound(table_id.to_string()))?;
        Ok(record.config.currency)
    }

    /// Move `amount` from MAIN to IN_PLAY for a table buy-in.
    pub async fn buy_in(
        &self,
        user_id: UserId,
        table_id: &str,
        amount: Amount,
    ) -> Result<(), CoreError> {
        if amount <= 0 {
            return Err(CoreError::Validation("buy-in amount must be positive".into()));
        }
        let currency = self.table_currency(table_id).await?;
        let main = AccountKey::main(user_id, &currency);
        let in_play = AccountKey::in_play(user_id, &currency);
        self.ledger.upsert_account(&in_play).await?;

        let reference = format!("table:{}", table_id);
        let metadata = json!({ "table_id": table_id });
        self.ledger
            .apply_transaction(&[
                Posting::new(main, -amount, EntryKind::BuyIn)
                    .with_reference(&reference)
                    .with_metadata(metadata.clone()),
                Posting::new(in_play, amount, EntryKind::BuyIn)
                    .with_reference(&reference)
                    .with_metadata(metadata),
            ])
            .await?;
        tracing::info!(user_id, table_id, amount, "buy-in applied");
        Ok(())
    }

    /// Move `amount` from IN_PLAY back to MAIN.
    pub async fn cash_out(
        &self,
        user_id: UserId,
        table_id: &str,
        amount: Amount,
    ) -> Result<(), CoreError> {
        if amount <= 0 {
            return Err(CoreError::Validation("cash-out amount must be positive".into()));
        }
        let currency = self.table_currency(table_id).await?;
        let main = AccountKey::main(user_id, &currency);
        let in_play = AccountKey::in_play(user_id, &currency);
        self.ledger.upsert_account(&main).await?;

        let reference = format!("table:{}", table_id);
        let metadata = json!({ "table_id": table_id });
        self.ledger
            .apply_transaction(&[
                Posting::new(in_play, -amount, EntryKind::CashOut)
                    .with_reference(&reference)
                    .with_metadata(metadata.clone()),
                Posting::new(main, amount, EntryKind::CashOut)
                    .with_reference(&reference)
                    .with_metadata(metadata),
            ])
            .await?;
        tracing::info!(user_id, table_id, amount, "cash-out applied");
        Ok(())
    }

    /// Idempotently make sure the user's MAIN account exists.
    pub async fn ensure_accounts(&self, user_id: UserId, currency: &str) -> Result<(), CoreError> {
        self.ledger
            .upsert_account(&AccountKey::main(user_id, currency))
            .await?;
        Ok(())
    }

    /// Both cached balances; a missing account reads as zero.
    pub async fn balances(&self, user_id: UserId, currency: &str) -> Result<UserBalances, CoreError> {
        let main = self.read_or_zero(&AccountKey::main(user_id, currency)).await?;
        let in_play = self
            .read_or_zero(&AccountKey::in_play(user_id, currency))
            .await?;
        Ok(UserBalances { main, in_play })
    }

    async fn read_or_zero(&self, key: &AccountKey) -> Result<Amount, CoreError> {
        match self.ledger.balance(key).await {
            Ok(balance) => Ok(balance),
            Err(LedgerError::AccountMissing(_)) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Buy in and take a seat, deduplicated by a client idempotency key.
    ///
    /// Replays with the same key return the cached result without
    /// touching the ledger; a concurrent attempt with the same key is
    /// rejected while the first is in flight.
    pub async fn buy_in_and_sit(
        &self,
        idempotency_key: &str,
        user_id: UserId,
        table_id: &str,
        seat: SeatIdx,
        amount: Amount,
    ) -> Result<MaskedView, CoreError> {
        let result_key = format!("idempotency:result:{}", idempotency_key);
        let processing_key = format!("{}:processing", result_key);

        if let Some(cached) = self.state.kv_get(&result_key).await? {
            tracing::info!(user_id, table_id, key = idempotency_key, "idempotent replay served from cache");
            return serde_json::from_str(&cached)
                .map_err(|e| CoreError::Internal(format!("corrupt cached result: {}", e)));
        }

        let claimed = self
            .state
            .kv_set_nx(
                &processing_key,
                "1",
                Duration::from_secs(self.config.idempotency_processing_ttl_secs),
            )
            .await?;
        if !claimed {
            return Err(CoreError::IdempotencyInProgress);
        }

        let outcome = self
            .buy_in_and_sit_inner(user_id, table_id, seat, amount)
            .await;

        if let Ok(view) = &outcome {
            match serde_json::to_string(view) {
                Ok(serialized) => {
                    if let Err(e) = self
                        .state
                        .kv_set(
                            &result_key,
                            &serialized,
                            Duration::from_secs(self.config.idempotency_ttl_secs),
                        )
                        .await
                    {
                        tracing::warn!(key = idempotency_key, error = %e, "result cache write failed");
                    }
                }
                Err(e) => tracing::warn!(key = idempotency_key, error = %e, "result not cacheable"),
            }
        }
        if let Err(e) = self.state.kv_del(&processing_key).await {
            tracing::warn!(key = idempotency_key, error = %e, "processing flag cleanup failed");
        }
        outcome
    }

    async fn buy_in_and_sit_inner(
        &self,
        user_id: UserId,
        table_id: &str,
        seat: SeatIdx,
        amount: Amount,
    ) -> Result<MaskedView, CoreError> {
        self.buy_in(user_id, table_id, amount).await?;

        match self
            .orchestrator
            .process_action(
                table_id,
                Action::sit(user_id, seat, amount),
                Actor::User(user_id),
            )
            .await
        {
            Ok(view) => Ok(view),
            Err(e) => {
                tracing::warn!(
                    user_id,
                    table_id,
                    seat,
                    error = %e,
                    "seat action failed after buy-in; refunding"
                );
                self.refund_buy_in(user_id, table_id, amount).await;
                Err(e)
            }
        }
    }

    /// Compensating entry pair for a buy-in whose SIT did not go through.
    async fn refund_buy_in(&self, user_id: UserId, table_id: &str, amount: Amount) {
        let currency = match self.table_currency(table_id).await {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(user_id, table_id, amount, error = %e, "refund failed: table record missing");
                return;
            }
        };
        let reference = format!("table:{}", table_id);
        let postings = [
            Posting::new(AccountKey::in_play(user_id, &currency), -amount, EntryKind::Refund)
                .with_reference(&reference),
            Posting::new(AccountKey::main(user_id, &currency), amount, EntryKind::Refund)
                .with_reference(&reference),
        ];
        if let Err(e) = self.ledger.apply_transaction(&postings).await {
            tracing::error!(
                user_id,
                table_id,
                amount,
                error = %e,
                "refund transaction failed; manual reconciliation required"
            );
        }
    }
}
