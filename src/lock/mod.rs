//! Lock Manager - distributed per-table mutual exclusion (C3)
//!
//! At most one live handle per resource across the cluster. A handle is
//! leased: expiry auto-releases it, so a crashed holder cannot wedge a
//! table. Holders extend the lease mid-operation when an action runs
//! long; an extension failure means another holder took over, and the
//! caller MUST abort without writing through compare-and-set.

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::CoreError;

pub use self::memory::MemoryLockManager;
pub use self::redis::RedisLockManager;

/// Lock key for a table.
pub fn table_lock_resource(table_id: &str) -> String {
    format!("lock:table:{}", table_id)
}

#[derive(Error, Debug, Clone)]
pub enum LockError {
    #[error("lock contended: {0}")]
    Contended(String),

    #[error("lock lost (lease expired or taken over): {0}")]
    Lost(String),

    #[error("lock backend error: {0}")]
    Backend(String),
}

impl From<LockError> for CoreError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Contended(resource) => CoreError::LockContended(resource),
            LockError::Lost(resource) => CoreError::LockExpired(resource),
            LockError::Backend(msg) => CoreError::Store(msg),
        }
    }
}

/// A held lease on one resource.
#[async_trait]
pub trait LockHandle: Send {
    /// Refresh the lease to `lease` from now. `Lost` if the lease already
    /// expired or another holder took the resource over.
    async fn extend(&mut self, lease: Duration) -> Result<(), LockError>;

    /// Release early. Releasing a lease that was already taken over is
    /// a no-op for the new holder.
    async fn release(self: Box<Self>) -> Result<(), LockError>;
}

#[async_trait]
pub trait LockManager: Send + Sync {
    /// Block up to the configured retry budget; `Contended` on exhaustion.
    async fn acquire(
        &self,
        resource: &str,
        lease: Duration,
    ) -> Result<Box<dyn LockHandle>, LockError>;

    /// Single attempt; `None` means somebody else holds the lock.
    async fn try_acquire(
        &self,
        resource: &str,
        lease: Duration,
    ) -> Result<Option<Box<dyn LockHandle>>, LockError>;
}
