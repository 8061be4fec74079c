//! Shared harness for the integration suites: the full pipeline over the
//! in-memory backends and the deterministic simulation engine.

#![allow(dead_code)]

use std::sync::Arc;

use potline::config::AppConfig;
use potline::core_types::{Amount, SeatIdx, TableId, UserId};
use potline::engine::{Action, EngineFactory, EngineStatus};
use potline::financial::FinancialManager;
use potline::ledger::{AccountKey, EntryKind, LedgerStore, MemoryLedger, Posting};
use potline::lock::MemoryLockManager;
use potline::orchestrator::{Actor, Orchestrator};
use potline::persistence::MemoryColdStore;
use potline::queue::MemoryJobQueue;
use potline::service::{Backends, TableService};
use potline::store::{MemoryStateStore, StateStore};
use potline::testkit::SimEngineFactory;

pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.orchestrator.lock_retry_ms = 10;
    config.orchestrator.lock_retry_budget = 100;
    config.workers.backoff_base_ms = 10;
    config.workers.backoff_max_ms = 100;
    config
}

pub struct Harness {
    pub config: AppConfig,
    pub state: Arc<MemoryStateStore>,
    pub queue: Arc<MemoryJobQueue>,
    pub ledger: Arc<MemoryLedger>,
    pub cold: Arc<MemoryColdStore>,
    pub orchestrator: Arc<Orchestrator>,
    pub financial: Arc<FinancialManager>,
    pub service: Option<Arc<TableService>>,
}

impl Harness {
    /// Components only - no queue consumers. Enqueued jobs accumulate for
    /// inspection instead of running.
    pub fn bare() -> Self {
        Self::bare_with(test_config())
    }

    pub fn bare_with(config: AppConfig) -> Self {
        let state = Arc::new(MemoryStateStore::new());
        let locks = Arc::new(MemoryLockManager::new(
            std::time::Duration::from_millis(config.orchestrator.lock_retry_ms),
            config.orchestrator.lock_retry_budget,
        ));
        let queue = Arc::new(MemoryJobQueue::new(config.workers.clone()));
        let ledger = Arc::new(MemoryLedger::new());
        let cold = Arc::new(MemoryColdStore::new());
        let engines: Arc<dyn EngineFactory> = Arc::new(SimEngineFactory);

        let orchestrator = Arc::new(Orchestrator::new(
            state.clone(),
            locks,
            queue.clone(),
            engines,
            cold.clone(),
            config.orchestrator.clone(),
        ));
        let financial = Arc::new(FinancialManager::new(
            ledger.clone(),
            state.clone(),
            cold.clone(),
            orchestrator.clone(),
            config.orchestrator.clone(),
        ));

        Self {
            config,
            state,
            queue,
            ledger,
            cold,
            orchestrator,
            financial,
            service: None,
        }
    }

    /// Full service: workers consuming, broadcast running.
    pub fn full() -> Self {
        Self::full_with(test_config())
    }

    pub fn full_with(config: AppConfig) -> Self {
        let state = Arc::new(MemoryStateStore::new());
        let queue = Arc::new(MemoryJobQueue::new(config.workers.clone()));
        let ledger = Arc::new(MemoryLedger::new());
        let cold = Arc::new(MemoryColdStore::new());

        let backends = Backends {
            state: state.clone(),
            locks: Arc::new(MemoryLockManager::new(
                std::time::Duration::from_millis(config.orchestrator.lock_retry_ms),
                config.orchestrator.lock_retry_budget,
            )),
            queue: queue.clone(),
            ledger: ledger.clone(),
            cold: cold.clone(),
        };
        let service = TableService::start(backends, Arc::new(SimEngineFactory), &config);

        Self {
            config,
            state,
            queue,
            ledger,
            cold,
            orchestrator: service.orchestrator.clone(),
            financial: service.financial.clone(),
            service: Some(service),
        }
    }

    /// Credit a user's MAIN account with an external deposit.
    pub async fn seed_main(&self, user_id: UserId, amount: Amount) {
        let main = AccountKey::main(user_id, "USD");
        self.ledger.upsert_account(&main).await.unwrap();
        self.ledger
            .apply_transaction(&[Posting::new(main, amount, EntryKind::Deposit)])
            .await
            .unwrap();
    }

    /// Engine status of the canonical snapshot.
    pub async fn status(&self, table_id: &str) -> EngineStatus {
        let snapshot = self.state.load(table_id).await.unwrap().unwrap();
        SimEngineFactory.restore(&snapshot).unwrap().status()
    }

    pub async fn version(&self, table_id: &str) -> u64 {
        self.state.load(table_id).await.unwrap().unwrap().version
    }

    /// The player who is next to act.
    pub async fn next_actor(&self, table_id: &str) -> (UserId, SeatIdx) {
        let status = self.status(table_id).await;
        let seat = status.action_to.expect("no action pending");
        (status.player_at(seat).unwrap().user_id, seat)
    }

    /// Seat a player without going through the financial layer.
    pub async fn sit(&self, table_id: &str, user_id: UserId, seat: SeatIdx, stack: Amount) {
        self.orchestrator
            .process_action(
                table_id,
                Action::sit(user_id, seat, stack),
                Actor::User(user_id),
            )
            .await
            .unwrap();
    }

    /// Create a cash table and seat two 1000-chip stacks.
    pub async fn heads_up_table(&self) -> TableId {
        let table_id = self
            .orchestrator
            .create_table(potline::config::TableConfig::cash(5, 10, 6))
            .await
            .unwrap();
        self.sit(&table_id, 1, 0, 1_000).await;
        self.sit(&table_id, 2, 1, 1_000).await;
        table_id
    }

    /// Deal as the system.
    pub async fn deal(&self, table_id: &str) {
        self.orchestrator
            .process_action(table_id, Action::deal(), Actor::System)
            .await
            .unwrap();
    }

    /// Drive the hand forward one passive action (check, else call).
    pub async fn check_or_call(&self, table_id: &str) {
        let (user_id, _) = self.next_actor(table_id).await;
        let checked = self
            .orchestrator
            .process_action(table_id, Action::check(user_id), Actor::User(user_id))
            .await;
        if checked.is_err() {
            self.orchestrator
                .process_action(table_id, Action::call(user_id), Actor::User(user_id))
                .await
                .unwrap();
        }
    }

    /// Passive play until the hand completes (bounded).
    pub async fn play_hand_to_showdown(&self, table_id: &str) {
        for _ in 0..40 {
            if self.status(table_id).await.winners.is_some() {
                return;
            }
            self.check_or_call(table_id).await;
        }
        panic!("hand did not complete");
    }

    /// Assert `balance == Σ entries` for an account (zero if absent).
    pub async fn assert_balance_consistent(&self, key: &AccountKey) {
        let (balance, entry_sum) = match self.ledger.balance(key).await {
            Ok(balance) => {
                let sum: Amount = self
                    .ledger
                    .entries(key)
                    .await
                    .unwrap()
                    .iter()
                    .map(|e| e.amount)
                    .sum();
                (balance, sum)
            }
            Err(_) => (0, 0),
        };
        assert_eq!(balance, entry_sum, "ledger out of balance for {}", key);
    }
}
