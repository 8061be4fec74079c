//! Settlement Worker (C6)
//!
//! Turns a completed hand into ledger entries: one rake credit on the
//! house account and one signed entry per player whose stack moved. All
//! postings of a hand go through a single ledger transaction, and every
//! posting references `hand:{id}`, so replays are absorbed by the
//! settlement uniqueness rule in the store.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::{SettleHandJob, hand_reference};
use crate::core_types::UserId;
use crate::error::CoreError;
use crate::ledger::{AccountKey, EntryKind, LedgerError, LedgerStore, Posting};
use crate::queue::{Job, JobHandler};

pub struct SettlementWorker {
    ledger: Arc<dyn LedgerStore>,
    house_user_id: UserId,
}

impl SettlementWorker {
    pub fn new(ledger: Arc<dyn LedgerStore>, house_user_id: UserId) -> Self {
        Self {
            ledger,
            house_user_id,
        }
    }

    pub async fn settle(&self, job: &SettleHandJob) -> Result<(), CoreError> {
        let reference = hand_reference(job.hand_id);
        let metadata = json!({ "table_id": job.table_id });
        let mut postings = Vec::with_capacity(job.deltas.len() + 1);

        if job.rake_total > 0 {
            let house = AccountKey::main(self.house_user_id, &job.currency);
            self.ledger.upsert_account(&house).await?;
            postings.push(
                Posting::new(house, job.rake_total, EntryKind::Rake)
                    .with_reference(&reference)
                    .with_metadata(metadata.clone()),
            );
        }

        for player in &job.deltas {
            if player.delta == 0 {
                continue;
            }
            let account = AccountKey::in_play(player.user_id, &job.currency);

            // An operator-initiated stand can pre-settle the seat between
            // hand completion and this job. A posting that would push the
            // account negative is skipped, not forced through.
            let current = match self.ledger.balance(&account).await {
                Ok(balance) => balance,
                Err(LedgerError::AccountMissing(_)) => {
                    tracing::warn!(
                        table_id = %job.table_id,
                        hand_id = job.hand_id,
                        user_id = player.user_id,
                        "settlement target account missing; posting skipped"
                    );
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if current + player.delta < 0 {
                tracing::warn!(
                    table_id = %job.table_id,
                    hand_id = job.hand_id,
                    user_id = player.user_id,
                    balance = current,
                    delta = player.delta,
                    "settlement posting would underflow; skipped"
                );
                continue;
            }

            let kind = if player.delta > 0 {
                EntryKind::HandWin
            } else {
                EntryKind::HandLoss
            };
            postings.push(
                Posting::new(account, player.delta, kind)
                    .with_reference(&reference)
                    .with_metadata(metadata.clone()),
            );
        }

        if postings.is_empty() {
            return Ok(());
        }

        let applied = self.ledger.apply_transaction(&postings).await?;
        tracing::info!(
            table_id = %job.table_id,
            hand_id = job.hand_id,
            postings = postings.len(),
            applied,
            rake = job.rake_total,
            "hand settled"
        );
        Ok(())
    }
}

#[async_trait]
impl JobHandler for SettlementWorker {
    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        let payload: SettleHandJob = serde_json::from_value(job.payload.clone())?;
        self.settle(&payload).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::Amount;
    use crate::ledger::MemoryLedger;
    use crate::workers::PlayerDelta;

    async fn seeded(user: UserId, amount: Amount, ledger: &MemoryLedger) {
        let key = AccountKey::in_play(user, "USD");
        ledger.upsert_account(&key).await.unwrap();
        if amount > 0 {
            ledger
                .apply_transaction(&[Posting::new(key, amount, EntryKind::BuyIn)])
                .await
                .unwrap();
        }
    }

    fn job(hand_id: u64, deltas: Vec<PlayerDelta>, rake: Amount) -> SettleHandJob {
        SettleHandJob {
            table_id: "t1".into(),
            hand_id,
            deltas,
            rake_total: rake,
            currency: "USD".into(),
        }
    }

    #[tokio::test]
    async fn test_settlement_moves_deltas_and_rake() {
        let ledger = Arc::new(MemoryLedger::new());
        seeded(1, 1_000, &ledger).await;
        seeded(2, 1_000, &ledger).await;
        let worker = SettlementWorker::new(ledger.clone(), 0);

        // Player 2 lost 100, player 1 won 95, rake 5
        worker
            .settle(&job(
                7,
                vec![
                    PlayerDelta {
                        user_id: 1,
                        delta: 95,
                    },
                    PlayerDelta {
                        user_id: 2,
                        delta: -100,
                    },
                ],
                5,
            ))
            .await
            .unwrap();

        assert_eq!(
            ledger.balance(&AccountKey::in_play(1, "USD")).await.unwrap(),
            1_095
        );
        assert_eq!(
            ledger.balance(&AccountKey::in_play(2, "USD")).await.unwrap(),
            900
        );
        assert_eq!(
            ledger.balance(&AccountKey::main(0, "USD")).await.unwrap(),
            5
        );
        assert!(ledger
            .entry_exists(&AccountKey::main(0, "USD"), "hand:7", EntryKind::Rake)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_settlement_replay_does_not_double_post() {
        let ledger = Arc::new(MemoryLedger::new());
        seeded(1, 500, &ledger).await;
        let worker = SettlementWorker::new(ledger.clone(), 0);

        let payload = job(
            8,
            vec![PlayerDelta {
                user_id: 1,
                delta: 40,
            }],
            3,
        );
        worker.settle(&payload).await.unwrap();
        worker.settle(&payload).await.unwrap();

        assert_eq!(
            ledger.balance(&AccountKey::in_play(1, "USD")).await.unwrap(),
            540
        );
        assert_eq!(
            ledger.balance(&AccountKey::main(0, "USD")).await.unwrap(),
            3
        );
        assert_eq!(
            ledger
                .entries(&AccountKey::in_play(1, "USD"))
                .await
                .unwrap()
                .len(),
            2 // buy-in + one settlement entry
        );
    }

    #[tokio::test]
    async fn test_underflow_posting_is_skipped() {
        let ledger = Arc::new(MemoryLedger::new());
        seeded(1, 1_000, &ledger).await;
        seeded(2, 50, &ledger).await; // pre-settled by an operator stand
        let worker = SettlementWorker::new(ledger.clone(), 0);

        worker
            .settle(&job(
                9,
                vec![
                    PlayerDelta {
                        user_id: 1,
                        delta: 100,
                    },
                    PlayerDelta {
                        user_id: 2,
                        delta: -100,
                    },
                ],
                0,
            ))
            .await
            .unwrap();

        // The winner is still credited; the underflowing loss is skipped
        assert_eq!(
            ledger.balance(&AccountKey::in_play(1, "USD")).await.unwrap(),
            1_100
        );
        assert_eq!(
            ledger.balance(&AccountKey::in_play(2, "USD")).await.unwrap(),
            50
        );
    }

    #[tokio::test]
    async fn test_zero_rake_writes_no_rake_entry() {
        let ledger = Arc::new(MemoryLedger::new());
        seeded(1, 100, &ledger).await;
        let worker = SettlementWorker::new(ledger.clone(), 0);

        worker
            .settle(&job(
                10,
                vec![PlayerDelta {
                    user_id: 1,
                    delta: 10,
                }],
                0,
            ))
            .await
            .unwrap();

        assert!(ledger
            .balance(&AccountKey::main(0, "USD"))
            .await
            .is_err());
    }
}
