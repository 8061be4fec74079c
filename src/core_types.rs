//! Core types used throughout the system
//!
//! These are fundamental type aliases used by all modules.
//! They provide semantic meaning and enable future type evolution.

/// User ID - globally unique, immutable after assignment.
///
/// Assigned by the (out-of-scope) auth layer; the core only compares it
/// against the `player_id` carried by table actions.
pub type UserId = u64;

/// Table ID - string key of a table across the hot store, the lock
/// namespace and the cold store (`table:{id}`, `lock:table:{id}`).
pub type TableId = String;

/// Hand ID - unique within the system, generated when a hand completes.
pub type HandId = u64;

/// Snapshot version - strictly increasing per table, starting at 0.
pub type Version = u64;

/// Seat index on a table (0-based).
pub type SeatIdx = u8;

/// Monetary amount in the smallest currency unit (cents).
///
/// Signed: ledger entries are signed deltas, and per-hand net stack
/// deltas are negative for losers.
pub type Amount = i64;
