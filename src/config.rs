//! Service and table configuration
//!
//! `AppConfig` is the process configuration, loaded from a YAML file
//! (path from `POTLINE_CONFIG`, default `potline.yaml`) with environment
//! fallbacks for connection URLs. `TableConfig` is the per-table
//! configuration supplied by `create_table` and carried inside the
//! engine state.

use serde::{Deserialize, Serialize};

use crate::core_types::{Amount, UserId};

// ============================================================
// PER-TABLE CONFIGURATION
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableMode {
    Cash,
    Tournament,
}

/// One tournament blind level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlindLevel {
    pub small_blind: Amount,
    pub big_blind: Amount,
}

/// Per-table configuration as supplied by `create_table`.
///
/// Amounts are in the smallest currency unit. `rake_bps` is basis points
/// of the pot, capped at `rake_cap` (0 disables rake entirely).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableConfig {
    pub small_blind: Amount,
    pub big_blind: Amount,
    pub max_players: u8,
    #[serde(default = "default_mode")]
    pub mode: TableMode,
    #[serde(default)]
    pub rake_bps: u32,
    #[serde(default)]
    pub rake_cap: Amount,
    /// Extra seconds granted when a player activates their time bank.
    #[serde(default)]
    pub time_bank_secs: Option<u32>,
    /// Base per-action timeout; falls back to the orchestrator default.
    #[serde(default)]
    pub action_timeout_secs: Option<u32>,
    #[serde(default = "default_currency")]
    pub currency: String,
    /// Tournament blind ladder; expanded to the default ladder when the
    /// mode is tournament and none is supplied.
    #[serde(default)]
    pub blind_levels: Option<Vec<BlindLevel>>,
    /// Minutes between tournament blind level increases.
    #[serde(default = "default_blind_level_minutes")]
    pub blind_level_minutes: u32,
}

fn default_mode() -> TableMode {
    TableMode::Cash
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_blind_level_minutes() -> u32 {
    10
}

impl TableConfig {
    pub fn cash(small_blind: Amount, big_blind: Amount, max_players: u8) -> Self {
        Self {
            small_blind,
            big_blind,
            max_players,
            mode: TableMode::Cash,
            rake_bps: 0,
            rake_cap: 0,
            time_bank_secs: None,
            action_timeout_secs: None,
            currency: default_currency(),
            blind_levels: None,
            blind_level_minutes: default_blind_level_minutes(),
        }
    }

    /// Expand a tournament config that carries no explicit ladder into the
    /// default geometric ladder starting at the configured blinds.
    pub fn with_default_blind_ladder(mut self) -> Self {
        if self.mode == TableMode::Tournament && self.blind_levels.is_none() {
            self.blind_levels = Some(default_blind_ladder(self.small_blind, self.big_blind));
        }
        self
    }
}

/// Default tournament ladder: blinds double each level, 12 levels.
pub fn default_blind_ladder(small_blind: Amount, big_blind: Amount) -> Vec<BlindLevel> {
    let mut levels = Vec::with_capacity(12);
    let (mut sb, mut bb) = (small_blind.max(1), big_blind.max(2));
    for _ in 0..12 {
        levels.push(BlindLevel {
            small_blind: sb,
            big_blind: bb,
        });
        sb = sb.saturating_mul(2);
        bb = bb.saturating_mul(2);
    }
    levels
}

// ============================================================
// PROCESS CONFIGURATION
// ============================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub log_dir: String,
    pub log_file: String,
    /// "hourly", "daily" or "never"
    pub rotation: String,
    pub log_level: String,
    pub use_json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: "logs".to_string(),
            log_file: "potline.log".to_string(),
            rotation: "daily".to_string(),
            log_level: "info".to_string(),
            use_json: false,
        }
    }
}

/// Orchestrator tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Lock lease for one action; generous for the expected path.
    pub lock_lease_ms: u64,
    /// Delay between lock acquisition attempts.
    pub lock_retry_ms: u64,
    /// Attempts before `acquire` gives up with LockContended.
    pub lock_retry_budget: u32,
    /// Short lease used by the next-hand worker's single-attempt lock.
    pub short_lock_lease_ms: u64,
    /// Hot-store snapshot TTL, refreshed on every write.
    pub snapshot_ttl_secs: u64,
    /// Base per-action timeout when the table config has none.
    pub action_timeout_secs: u32,
    /// Bonus seconds when the time bank activated on this action.
    pub time_bank_bonus_secs: u32,
    /// Grace delay before the next hand is auto-dealt.
    pub next_hand_delay_ms: u64,
    /// TTL of cached idempotency results.
    pub idempotency_ttl_secs: u64,
    /// TTL of the idempotency processing flag.
    pub idempotency_processing_ttl_secs: u64,
    /// User id owning the house rake account.
    pub house_user_id: UserId,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            lock_lease_ms: 10_000,
            lock_retry_ms: 100,
            lock_retry_budget: 30,
            short_lock_lease_ms: 3_000,
            snapshot_ttl_secs: 24 * 3600,
            action_timeout_secs: 20,
            time_bank_bonus_secs: 30,
            next_hand_delay_ms: 5_000,
            idempotency_ttl_secs: 60,
            idempotency_processing_ttl_secs: 15,
            house_user_id: 0,
        }
    }
}

/// Job consumer tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_attempts: 5,
            backoff_base_ms: 200,
            backoff_max_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub log: LogConfig,
    /// Hot-store URL; in-memory backends are used when absent (dev mode).
    pub redis_url: Option<String>,
    /// Ledger/cold-store URL; in-memory backends are used when absent.
    pub database_url: Option<String>,
    pub pg_max_connections: Option<u32>,
    pub orchestrator: OrchestratorConfig,
    pub workers: WorkerConfig,
}

impl AppConfig {
    /// Load from `POTLINE_CONFIG` (default `potline.yaml`); a missing file
    /// yields the defaults. `REDIS_URL` / `DATABASE_URL` env vars override
    /// the file.
    pub fn load() -> anyhow::Result<Self> {
        let path =
            std::env::var("POTLINE_CONFIG").unwrap_or_else(|_| "potline.yaml".to_string());
        let mut config: AppConfig = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_yaml::from_str(&raw)
                .map_err(|e| anyhow::anyhow!("invalid config {}: {}", path, e))?,
            Err(_) => AppConfig::default(),
        };
        if let Ok(url) = std::env::var("REDIS_URL") {
            config.redis_url = Some(url);
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = Some(url);
        }
        Ok(config)
    }
}
