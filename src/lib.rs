//! potline - multi-table poker service core
//!
//! The Table Orchestrator + Financial Settlement pipeline: every action
//! on a table is applied to exactly one version of that table's state
//! under a distributed lock plus versioned compare-and-set, and every
//! chip credited or debited to a player is reflected in an append-only
//! double-entry ledger.
//!
//! # Modules
//!
//! - [`core_types`] - Fundamental type aliases (TableId, UserId, etc.)
//! - [`config`] - Process and per-table configuration
//! - [`error`] - The public error taxonomy
//! - [`engine`] - The black-box rules engine contract
//! - [`store`] - Versioned snapshot store with CAS, pub/sub and TTL'd KV
//! - [`lock`] - Distributed per-table lock with lease + extension
//! - [`queue`] - Delayed jobs with singleton ids and repeats
//! - [`ledger`] - Append-only double-entry ledger with cached balances
//! - [`persistence`] - Write-behind cold storage (tables, hand histories)
//! - [`orchestrator`] - The central action pipeline
//! - [`workers`] - Settlement, timeout, next-hand, persist, archive
//! - [`financial`] - Buy-in / cash-out between MAIN and IN_PLAY
//! - [`broadcast`] - Per-process fan-out of masked views
//! - [`service`] - Wiring and graceful shutdown
//! - [`testkit`] - Deterministic simulation engine (`sim-engine` feature)

// Core types - must be first!
pub mod core_types;

// Configuration
pub mod config;

// Infrastructure
pub mod error;
pub mod ledger;
pub mod lock;
pub mod logging;
pub mod persistence;
pub mod queue;
pub mod shutdown;
pub mod store;

// Domain
pub mod broadcast;
pub mod engine;
pub mod financial;
pub mod orchestrator;
pub mod service;
pub mod workers;

#[cfg(feature = "sim-engine")]
pub mod testkit;

// Convenient re-exports at crate root
pub use config::{AppConfig, TableConfig, TableMode};
pub use core_types::{Amount, HandId, SeatIdx, TableId, UserId, Version};
pub use engine::{Action, ActionType, Engine, EngineFactory, EngineStatus, MaskedView, Street};
pub use error::CoreError;
pub use financial::{FinancialManager, UserBalances};
pub use ledger::{AccountKey, AccountType, EntryKind, LedgerStore, Posting};
pub use orchestrator::{Actor, NextHandOutcome, Orchestrator, TimeoutOutcome};
pub use queue::{JobQueue, queues};
pub use service::{Backends, TableService, memory_backends, network_backends};
pub use store::{StateEvent, StateStore, TableSnapshot};
