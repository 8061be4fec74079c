//! Table Orchestrator (C5) - the central algorithm
//!
//! One action = lock → load → identity check → engine.act → versioned
//! compare-and-set → publish → enqueue side effects → masked view. The
//! lock serializes actions per table; the CAS catches lock loss. Both
//! guards stay: the lock is belt, the CAS is suspenders.
//!
//! The timeout (C7) and next-hand (C8) entry points re-use the same
//! commit pipeline, so side-effect scheduling and publish behavior are
//! identical no matter who advanced the table.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;

use crate::config::{OrchestratorConfig, TableConfig, TableMode};
use crate::core_types::{HandId, SeatIdx, TableId, UserId, Version};
use crate::engine::{
    Action, ActionType, Engine, EngineFactory, EngineStatus, MaskedView, Street,
};
use crate::error::CoreError;
use crate::lock::{LockHandle, LockManager, table_lock_resource};
use crate::persistence::{ColdStore, TableRecord, TableStatus};
use crate::queue::{JobOpts, JobQueue, queues};
use crate::store::{StateEvent, StateStore, TableSnapshot};
use crate::workers::{
    ArchiveHandJob, NextHandJob, PersistSnapshotJob, PlayerDelta, PlayerTimeoutJob,
    SettleHandJob,
};

// ============================================================
// IDS
// ============================================================

/// Snowflake-style id generator for table and hand ids.
///
/// Format: timestamp millis (41 bits) | machine_id (8 bits) | sequence (15 bits)
struct IdGenerator {
    machine_id: u8,
    sequence: u32,
    last_timestamp: u64,
}

impl IdGenerator {
    fn new(machine_id: u8) -> Self {
        Self {
            machine_id,
            sequence: 0,
            last_timestamp: 0,
        }
    }

    fn generate(&mut self) -> u64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        if now == self.last_timestamp {
            self.sequence += 1;
        } else {
            self.sequence = 0;
            self.last_timestamp = now;
        }

        (now << 23) | ((self.machine_id as u64) << 15) | (self.sequence as u64 & 0x7FFF)
    }
}

// ============================================================
// TYPES
// ============================================================

/// Who submits an action: an authenticated user, or the system itself
/// (timers, auto-deal, blind level schedules).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    System,
    User(UserId),
}

impl Actor {
    pub fn user_id(&self) -> Option<UserId> {
        match self {
            Actor::System => None,
            Actor::User(user_id) => Some(*user_id),
        }
    }
}

/// Result of a timeout job delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutOutcome {
    /// The player was folded; the table moved to this version.
    Applied(Version),
    /// The table moved past the expected version; the timer self-cancelled.
    Superseded,
    /// No snapshot in the hot store (TTL expiry or table gone).
    TableGone,
}

/// Result of a next-hand job delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextHandOutcome {
    Dealt(Version),
    /// Lock contention: a manual deal is in flight, exit silently.
    ManualDealWon,
    /// Snapshot not at a completed-hand state (already re-dealt).
    HandNotComplete,
    /// Fewer than two players hold chips; the table goes back to waiting.
    NotEnoughPlayers,
    TableGone,
}

// ============================================================
// ORCHESTRATOR
// ============================================================

pub struct Orchestrator {
    state: Arc<dyn StateStore>,
    locks: Arc<dyn LockManager>,
    queue: Arc<dyn JobQueue>,
    engines: Arc<dyn EngineFactory>,
    cold: Arc<dyn ColdStore>,
    config: OrchestratorConfig,
    ids: std::sync::Mutex<IdGenerator>,
}

impl Orchestrator {
    pub fn new(
        state: Arc<dyn StateStore>,
        locks: Arc<dyn LockManager>,
        queue: Arc<dyn JobQueue>,
        engines: Arc<dyn EngineFactory>,
        cold: Arc<dyn ColdStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            state,
            locks,
            queue,
            engines,
            cold,
            config,
            ids: std::sync::Mutex::new(IdGenerator::new(1)),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    fn next_id(&self) -> u64 {
        self.ids.lock().unwrap().generate()
    }

    fn snapshot_ttl(&self) -> Duration {
        Duration::from_secs(self.config.snapshot_ttl_secs)
    }

    // --------------------------------------------------------
    // Public surface
    // --------------------------------------------------------

    /// Create a table: initialize the engine, write the version-0
    /// snapshot, record the table row.
    pub async fn create_table(&self, config: TableConfig) -> Result<TableId, CoreError> {
        if config.max_players < 2 {
            return Err(CoreError::Validation("max_players must be at least 2".into()));
        }
        if config.small_blind <= 0 || config.big_blind < config.small_blind {
            return Err(CoreError::Validation("invalid blind structure".into()));
        }

        let config = config.with_default_blind_ladder();
        let engine = self.engines.create(&config)?;
        let snapshot = TableSnapshot::new(0, engine.snapshot()?);
        let table_id = format!("t-{:016x}", self.next_id());

        self.state
            .compare_and_set(&table_id, None, &snapshot, self.snapshot_ttl())
            .await?;

        let record = TableRecord {
            table_id: table_id.clone(),
            config: config.clone(),
            state: serde_json::to_value(&snapshot)
                .map_err(|e| CoreError::Internal(e.to_string()))?,
            status: TableStatus::Waiting,
            updated_at: chrono::Utc::now(),
        };
        self.cold.upsert_table(&record).await?;

        if config.mode == TableMode::Tournament {
            let every = Duration::from_secs(config.blind_level_minutes as u64 * 60);
            let opts = JobOpts::delayed(every)
                .singleton(format!("blindlevel:{}", table_id))
                .repeating(every);
            if let Err(e) = self
                .queue
                .enqueue(
                    queues::BLIND_LEVEL,
                    "blind-level",
                    json!({ "table_id": table_id }),
                    opts,
                )
                .await
            {
                tracing::warn!(table_id = %table_id, error = %e, "blind level schedule not enqueued");
            }
        }

        tracing::info!(table_id = %table_id, "table created");
        Ok(table_id)
    }

    /// Apply one action to one table and return the actor's masked view.
    pub async fn process_action(
        &self,
        table_id: &str,
        action: Action,
        actor: Actor,
    ) -> Result<MaskedView, CoreError> {
        let lease = Duration::from_millis(self.config.lock_lease_ms);
        let mut lock = self
            .locks
            .acquire(&table_lock_resource(table_id), lease)
            .await?;
        let started = Instant::now();

        let result = self
            .apply_action(table_id, &action, actor, lock.as_mut(), started, lease)
            .await;

        if let Err(e) = lock.release().await {
            tracing::warn!(table_id, error = %e, "lock release failed");
        }
        result
    }

    /// Read-only masked projection.
    pub async fn get_state(
        &self,
        table_id: &str,
        viewer: Option<UserId>,
    ) -> Result<MaskedView, CoreError> {
        let snapshot = self
            .state
            .load(table_id)
            .await?
            .ok_or_else(|| CoreError::TableNotFound(table_id.to_string()))?;
        let engine = self.engines.restore(&snapshot)?;
        Ok(MaskedView {
            table_id: table_id.to_string(),
            version: snapshot.version,
            state: engine.view(viewer),
        })
    }

    // --------------------------------------------------------
    // Worker entry points
    // --------------------------------------------------------

    /// Fire a timeout against a specific snapshot version.
    ///
    /// No table lock here: the versioned CAS is the mandatory guard. Any
    /// timely action produced a new version, so the stale timer observes
    /// the mismatch and self-cancels.
    pub async fn process_timeout(
        &self,
        table_id: &str,
        player_id: UserId,
        expected_version: Version,
    ) -> Result<TimeoutOutcome, CoreError> {
        let snapshot = match self.state.load(table_id).await? {
            Some(s) => s,
            None => {
                tracing::warn!(table_id, "timeout fired for missing table");
                return Ok(TimeoutOutcome::TableGone);
            }
        };
        if snapshot.version != expected_version {
            tracing::debug!(
                table_id,
                expected_version,
                current_version = snapshot.version,
                "timeout superseded by a timely action"
            );
            return Ok(TimeoutOutcome::Superseded);
        }

        let mut engine = self.engines.restore(&snapshot)?;
        let prev_status = engine.status();
        if let Err(e) = engine.act(&Action::timeout(player_id)) {
            // Version matched but the engine disagrees about the actor;
            // nothing to do beyond surfacing it to the operator log.
            tracing::warn!(table_id, player_id, error = %e, "engine rejected timeout");
            return Ok(TimeoutOutcome::Superseded);
        }

        match self
            .finish_commit(table_id, &snapshot, &prev_status, engine.as_ref())
            .await
        {
            Ok(version) => {
                tracing::info!(table_id, player_id, version, "player timed out");
                Ok(TimeoutOutcome::Applied(version))
            }
            // Lost the CAS race to a timely action that slipped in after
            // our load: exactly the case the version binding exists for.
            Err(CoreError::ConcurrentModification { .. }) => Ok(TimeoutOutcome::Superseded),
            Err(e) => Err(e),
        }
    }

    /// Auto-deal the next hand after the grace delay.
    ///
    /// Contention on the short lock means a manual deal (or another
    /// action) is in flight; the job exits silently and the singleton id
    /// prevents a second attempt for the same version.
    pub async fn auto_deal(&self, table_id: &str) -> Result<NextHandOutcome, CoreError> {
        let lease = Duration::from_millis(self.config.short_lock_lease_ms);
        let lock = match self
            .locks
            .try_acquire(&table_lock_resource(table_id), lease)
            .await?
        {
            Some(lock) => lock,
            None => return Ok(NextHandOutcome::ManualDealWon),
        };

        let outcome = self.auto_deal_locked(table_id).await;

        if let Err(e) = lock.release().await {
            tracing::warn!(table_id, error = %e, "lock release failed");
        }
        outcome
    }

    async fn auto_deal_locked(&self, table_id: &str) -> Result<NextHandOutcome, CoreError> {
        let snapshot = match self.state.load(table_id).await? {
            Some(s) => s,
            None => return Ok(NextHandOutcome::TableGone),
        };
        let mut engine = self.engines.restore(&snapshot)?;
        let prev_status = engine.status();

        if !(prev_status.hand_complete() && prev_status.street == Street::Showdown) {
            return Ok(NextHandOutcome::HandNotComplete);
        }
        if prev_status.players_with_chips() < 2 {
            return Ok(NextHandOutcome::NotEnoughPlayers);
        }

        engine.act(&Action::deal())?;
        let version = self
            .finish_commit(table_id, &snapshot, &prev_status, engine.as_ref())
            .await?;
        tracing::info!(table_id, version, "next hand auto-dealt");
        Ok(NextHandOutcome::Dealt(version))
    }

    // --------------------------------------------------------
    // Internals
    // --------------------------------------------------------

    async fn apply_action(
        &self,
        table_id: &str,
        action: &Action,
        actor: Actor,
        lock: &mut dyn LockHandle,
        started: Instant,
        lease: Duration,
    ) -> Result<MaskedView, CoreError> {
        let snapshot = self
            .state
            .load(table_id)
            .await?
            .ok_or_else(|| CoreError::TableNotFound(table_id.to_string()))?;

        // Identity: a player may only act as themselves. TIMEOUT is
        // system-invoked and exempt from the player_id comparison, so a
        // user cannot submit it at all.
        match actor {
            Actor::User(_) if action.kind == ActionType::Timeout => {
                return Err(CoreError::Forbidden);
            }
            Actor::User(user_id) => {
                if let Some(player_id) = action.player_id
                    && player_id != user_id
                {
                    return Err(CoreError::IdentityMismatch);
                }
            }
            Actor::System => {}
        }

        let mut engine = self.engines.restore(&snapshot)?;
        let prev_status = engine.status();
        engine.act(action)?;

        // Long engine calls eat into the lease; refresh before writing.
        // A failed extension means the lease is gone and another holder
        // may be active: abort without touching the store.
        if started.elapsed() > lease * 3 / 5 {
            lock.extend(lease).await.map_err(|e| {
                tracing::error!(table_id, error = %e, "lock extension failed; aborting without write");
                CoreError::from(e)
            })?;
        }

        let version = self
            .finish_commit(table_id, &snapshot, &prev_status, engine.as_ref())
            .await?;

        Ok(MaskedView {
            table_id: table_id.to_string(),
            version,
            state: engine.view(actor.user_id()),
        })
    }

    /// Steps 5-11 of the action pipeline: stamp the next version, CAS,
    /// enqueue side effects, publish. Shared by the action, timeout and
    /// next-hand paths.
    async fn finish_commit(
        &self,
        table_id: &str,
        prev: &TableSnapshot,
        prev_status: &EngineStatus,
        engine: &dyn Engine,
    ) -> Result<Version, CoreError> {
        let status = engine.status();
        let version = prev.version + 1;
        let snapshot = TableSnapshot::new(version, engine.snapshot()?);

        self.state
            .compare_and_set(table_id, Some(prev.version), &snapshot, self.snapshot_ttl())
            .await?;

        // From here on the written state is canonical. A failed enqueue
        // only delays a worker that can be replayed from cold storage, so
        // these are logged, never propagated.
        self.enqueue_persist(table_id, &status, &snapshot).await;

        if status.winners.is_some() {
            self.fan_out_hand_complete(table_id, prev_status, &status, &snapshot, version)
                .await;
        } else if let Some(seat) = status.action_to {
            self.schedule_timeout(table_id, &status, seat, version).await;
        }

        let event = StateEvent::StateUpdate {
            table_id: table_id.to_string(),
            version,
        };
        if let Err(e) = self.state.publish(table_id, &event).await {
            tracing::warn!(table_id, version, error = %e, "publish failed; subscribers will catch up");
        }

        Ok(version)
    }

    async fn enqueue_persist(&self, table_id: &str, status: &EngineStatus, snapshot: &TableSnapshot) {
        let payload = PersistSnapshotJob {
            table_id: table_id.to_string(),
            status: derive_table_status(status),
            config: status.config.clone(),
            snapshot: snapshot.clone(),
        };
        self.enqueue_logged(
            queues::PERSIST_SNAPSHOT,
            "persist-snapshot",
            &payload,
            JobOpts::immediate(),
        )
        .await;
    }

    async fn fan_out_hand_complete(
        &self,
        table_id: &str,
        prev_status: &EngineStatus,
        status: &EngineStatus,
        snapshot: &TableSnapshot,
        version: Version,
    ) {
        let hand_id: HandId = self.next_id();

        // Net stack delta per player relative to the previous snapshot.
        // Blinds and bets of earlier streets were already folded into
        // prior versions; the engine guarantees conservation across the
        // whole hand.
        let deltas: Vec<PlayerDelta> = status
            .players
            .iter()
            .map(|p| {
                let before = prev_status
                    .player_at(p.seat)
                    .map(|q| q.stack)
                    .unwrap_or(0);
                PlayerDelta {
                    user_id: p.user_id,
                    delta: p.stack - before,
                }
            })
            .collect();

        let settle = SettleHandJob {
            table_id: table_id.to_string(),
            hand_id,
            deltas,
            rake_total: status.rake_this_hand,
            currency: status.config.currency.clone(),
        };
        self.enqueue_logged(queues::SETTLE_HAND, "settle-hand", &settle, JobOpts::immediate())
            .await;

        let archive = ArchiveHandJob {
            table_id: table_id.to_string(),
            hand_id,
            snapshot: snapshot.clone(),
        };
        self.enqueue_logged(
            queues::ARCHIVE_HAND,
            "archive-hand",
            &archive,
            JobOpts::immediate(),
        )
        .await;

        if status.players_with_chips() >= 2 {
            let next = NextHandJob {
                table_id: table_id.to_string(),
            };
            let opts = JobOpts::delayed(Duration::from_millis(self.config.next_hand_delay_ms))
                .singleton(format!("nexthand:{}:{}", table_id, version));
            self.enqueue_logged(queues::NEXT_HAND, "next-hand", &next, opts)
                .await;
        }

        tracing::info!(
            table_id,
            hand_id,
            version,
            rake = status.rake_this_hand,
            "hand complete; settlement fan-out enqueued"
        );
    }

    async fn schedule_timeout(
        &self,
        table_id: &str,
        status: &EngineStatus,
        seat: SeatIdx,
        version: Version,
    ) {
        let Some(player) = status.player_at(seat) else {
            tracing::error!(table_id, seat, "action_to seat has no player; no timeout scheduled");
            return;
        };

        let base = status
            .config
            .action_timeout_secs
            .unwrap_or(self.config.action_timeout_secs);
        let bonus = if status.time_bank_active_seat == Some(seat) {
            status
                .config
                .time_bank_secs
                .unwrap_or(self.config.time_bank_bonus_secs)
        } else {
            0
        };

        let payload = PlayerTimeoutJob {
            table_id: table_id.to_string(),
            player_id: player.user_id,
            seat,
            expected_version: version,
        };
        // The singleton id binds the timer to this exact version: any
        // later action produces a new version and therefore a new timer,
        // and the old one self-cancels on the version check.
        let opts = JobOpts::delayed(Duration::from_secs((base + bonus) as u64))
            .singleton(format!("timeout:{}:{}:{}", table_id, seat, version));
        self.enqueue_logged(queues::PLAYER_TIMEOUT, "player-timeout", &payload, opts)
            .await;
    }

    async fn enqueue_logged<T: serde::Serialize>(
        &self,
        queue: &str,
        name: &str,
        payload: &T,
        opts: JobOpts,
    ) {
        let payload = match serde_json::to_value(payload) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(queue, job = name, error = %e, "unserializable job payload");
                return;
            }
        };
        if let Err(e) = self.queue.enqueue(queue, name, payload, opts).await {
            tracing::warn!(queue, job = name, error = %e, "enqueue failed; replay from cold store");
        }
    }
}

/// Table lifecycle status as derivable from an engine status.
pub fn derive_table_status(status: &EngineStatus) -> TableStatus {
    if status.street == Street::Waiting {
        TableStatus::Waiting
    } else if status.hand_complete() && status.players_with_chips() < 2 {
        TableStatus::Waiting
    } else {
        TableStatus::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_generator_monotonic() {
        let mut ids = IdGenerator::new(1);
        let a = ids.generate();
        let b = ids.generate();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_actor_user_id() {
        assert_eq!(Actor::System.user_id(), None);
        assert_eq!(Actor::User(7).user_id(), Some(7));
    }
}
