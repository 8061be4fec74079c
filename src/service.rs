//! Service wiring
//!
//! Builds the orchestrator, financial manager, worker consumers and
//! broadcast multiplexer over a chosen set of backends, and owns the
//! graceful shutdown sequence: stop intake, let in-flight work finish,
//! close consumers, drop the pub/sub subscription.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tokio::task::JoinHandle;

use crate::broadcast::BroadcastMux;
use crate::config::AppConfig;
use crate::engine::EngineFactory;
use crate::financial::FinancialManager;
use crate::ledger::{LedgerStore, MemoryLedger, PgLedger};
use crate::lock::{LockManager, MemoryLockManager, RedisLockManager};
use crate::orchestrator::Orchestrator;
use crate::persistence::{ColdStore, MemoryColdStore, PgColdStore, schema};
use crate::queue::{JobQueue, MemoryJobQueue, queues};
use crate::shutdown::ShutdownSignal;
use crate::store::{MemoryStateStore, RedisStateStore, StateStore};
use crate::workers::{
    ArchiveWorker, BlindLevelWorker, NextHandWorker, PersistWorker, SettlementWorker,
    TimeoutWorker,
};

/// The shared mutable resources everything coordinates through.
pub struct Backends {
    pub state: Arc<dyn StateStore>,
    pub locks: Arc<dyn LockManager>,
    pub queue: Arc<dyn JobQueue>,
    pub ledger: Arc<dyn LedgerStore>,
    pub cold: Arc<dyn ColdStore>,
}

/// In-process backends: single-node dev mode and tests.
pub fn memory_backends(config: &AppConfig) -> Backends {
    Backends {
        state: Arc::new(MemoryStateStore::new()),
        locks: Arc::new(MemoryLockManager::new(
            Duration::from_millis(config.orchestrator.lock_retry_ms),
            config.orchestrator.lock_retry_budget,
        )),
        queue: Arc::new(MemoryJobQueue::new(config.workers.clone())),
        ledger: Arc::new(MemoryLedger::new()),
        cold: Arc::new(MemoryColdStore::new()),
    }
}

/// Redis + Postgres backends for production.
///
/// The job queue itself stays process-local: jobs enqueued on a node run
/// on that node, which is correct because every handler coordinates
/// through the shared stores (versioned CAS, ledger uniqueness, lock).
pub async fn network_backends(
    redis_url: &str,
    database_url: &str,
    config: &AppConfig,
) -> anyhow::Result<Backends> {
    let state = RedisStateStore::connect(redis_url).await?;
    let locks = RedisLockManager::connect(
        redis_url,
        Duration::from_millis(config.orchestrator.lock_retry_ms),
        config.orchestrator.lock_retry_budget,
    )
    .await?;

    let pool = PgPoolOptions::new()
        .max_connections(config.pg_max_connections.unwrap_or(10))
        .connect(database_url)
        .await?;
    schema::init_schema(&pool).await?;

    Ok(Backends {
        state: Arc::new(state),
        locks: Arc::new(locks),
        queue: Arc::new(MemoryJobQueue::new(config.workers.clone())),
        ledger: Arc::new(PgLedger::new(pool.clone())),
        cold: Arc::new(PgColdStore::new(pool)),
    })
}

pub struct TableService {
    pub orchestrator: Arc<Orchestrator>,
    pub financial: Arc<FinancialManager>,
    pub broadcast: Arc<BroadcastMux>,
    queue: Arc<dyn JobQueue>,
    shutdown: ShutdownSignal,
    broadcast_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TableService {
    /// Wire everything up and start the consumers. Requires a running
    /// tokio runtime.
    pub fn start(
        backends: Backends,
        engines: Arc<dyn EngineFactory>,
        config: &AppConfig,
    ) -> Arc<Self> {
        let Backends {
            state,
            locks,
            queue,
            ledger,
            cold,
        } = backends;

        let orchestrator = Arc::new(Orchestrator::new(
            state.clone(),
            locks,
            queue.clone(),
            engines.clone(),
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

        let concurrency = config.workers.concurrency;
        queue.register(
            queues::PERSIST_SNAPSHOT,
            concurrency,
            Arc::new(PersistWorker::new(cold.clone())),
        );
        queue.register(
            queues::SETTLE_HAND,
            concurrency,
            Arc::new(SettlementWorker::new(
                ledger.clone(),
                config.orchestrator.house_user_id,
            )),
        );
        queue.register(
            queues::ARCHIVE_HAND,
            concurrency,
            Arc::new(ArchiveWorker::new(cold.clone(), engines.clone())),
        );
        queue.register(
            queues::NEXT_HAND,
            concurrency,
            Arc::new(NextHandWorker::new(orchestrator.clone(), cold.clone())),
        );
        queue.register(
            queues::PLAYER_TIMEOUT,
            concurrency,
            Arc::new(TimeoutWorker::new(orchestrator.clone())),
        );
        queue.register(
            queues::BLIND_LEVEL,
            1,
            Arc::new(BlindLevelWorker::new(orchestrator.clone())),
        );

        let broadcast = Arc::new(BroadcastMux::new(state, engines));
        let shutdown = ShutdownSignal::new();
        let broadcast_task = tokio::spawn(broadcast.clone().run(shutdown.clone()));

        tracing::info!("table service started");
        Arc::new(Self {
            orchestrator,
            financial,
            broadcast,
            queue,
            shutdown,
            broadcast_task: std::sync::Mutex::new(Some(broadcast_task)),
        })
    }

    /// Graceful shutdown: in-flight jobs complete, then consumers and the
    /// broadcast subscription stop.
    pub async fn shutdown(&self) {
        tracing::info!("table service shutting down");
        self.shutdown.request();
        self.queue.close().await;
        let task = self.broadcast_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        tracing::info!("table service stopped");
    }
}

#[cfg(all(test, feature = "sim-engine"))]
mod tests {
    use super::*;
    use crate::testkit::SimEngineFactory;

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let config = AppConfig::default();
        let service = TableService::start(
            memory_backends(&config),
            Arc::new(SimEngineFactory),
            &config,
        );
        // Idle service stops cleanly
        service.shutdown().await;
    }
}
