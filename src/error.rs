//! Core Error Types
//!
//! The single public error taxonomy for the orchestrator and financial
//! surfaces. Subsystem errors (state store, lock manager, job queue,
//! ledger, engine) convert into this enum at the component boundary.
//!
//! Error codes are stable strings for API responses; `http_status` is the
//! suggested mapping for the transport layer.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum CoreError {
    // === Not found ===
    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Account not found: {0}")]
    AccountMissing(String),

    // === Validation ===
    #[error("Invalid request: {0}")]
    Validation(String),

    // === Identity / authorization ===
    #[error("Action player_id does not match the acting user")]
    IdentityMismatch,

    #[error("Operation not permitted")]
    Forbidden,

    // === Conflict (version / CAS / idempotency) ===
    #[error("Snapshot version moved underneath the lock holder (expected {expected})")]
    ConcurrentModification { expected: u64 },

    #[error("Another request with the same idempotency key is in flight")]
    IdempotencyInProgress,

    // === Contention (lock) ===
    #[error("Table lock contended: {0}")]
    LockContended(String),

    #[error("Table lock lease lost mid-operation: {0}")]
    LockExpired(String),

    // === Funds ===
    #[error("Insufficient funds")]
    InsufficientFunds,

    // === Engine ===
    #[error("Engine rejected action: {code}")]
    EngineInvalid { code: String, message: String },

    #[error("Engine state corrupt: {0}")]
    EngineCorrupt(String),

    // === Internal ===
    #[error("State store error: {0}")]
    Store(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Job queue error: {0}")]
    Queue(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Stable error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::TableNotFound(_) => "TABLE_NOT_FOUND",
            CoreError::AccountMissing(_) => "ACCOUNT_MISSING",
            CoreError::Validation(_) => "VALIDATION",
            CoreError::IdentityMismatch => "IDENTITY_MISMATCH",
            CoreError::Forbidden => "FORBIDDEN",
            CoreError::ConcurrentModification { .. } => "CONCURRENT_MODIFICATION",
            CoreError::IdempotencyInProgress => "IDEMPOTENCY_IN_PROGRESS",
            CoreError::LockContended(_) => "LOCK_CONTENDED",
            CoreError::LockExpired(_) => "LOCK_EXPIRED",
            CoreError::InsufficientFunds => "INSUFFICIENT_FUNDS",
            CoreError::EngineInvalid { .. } => "ENGINE_INVALID",
            CoreError::EngineCorrupt(_) => "ENGINE_CORRUPT",
            CoreError::Store(_) => "STORE_ERROR",
            CoreError::Database(_) => "DATABASE_ERROR",
            CoreError::Queue(_) => "QUEUE_ERROR",
            CoreError::Internal(_) => "INTERNAL",
        }
    }

    /// Suggested HTTP status code
    pub fn http_status(&self) -> u16 {
        match self {
            CoreError::TableNotFound(_) | CoreError::AccountMissing(_) => 404,
            CoreError::Validation(_)
            | CoreError::InsufficientFunds
            | CoreError::EngineInvalid { .. } => 400,
            CoreError::IdentityMismatch | CoreError::Forbidden => 403,
            CoreError::IdempotencyInProgress => 409,
            CoreError::LockContended(_) => 503,
            // Should not occur under correct locking; its presence indicates
            // a bug or lock loss, so it surfaces as a server error.
            CoreError::ConcurrentModification { .. } => 500,
            CoreError::LockExpired(_)
            | CoreError::EngineCorrupt(_)
            | CoreError::Store(_)
            | CoreError::Database(_)
            | CoreError::Queue(_)
            | CoreError::Internal(_) => 500,
        }
    }

    /// Whether the caller may safely retry the identical request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::LockContended(_))
    }
}
