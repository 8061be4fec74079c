//! In-process lock manager
//!
//! Same lease semantics as the Redis backend, scoped to one process.
//! Used by tests and single-node dev mode.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use super::{LockError, LockHandle, LockManager};

struct Held {
    token: u64,
    deadline: Instant,
}

pub struct MemoryLockManager {
    locks: Arc<DashMap<String, Held>>,
    retry_delay: Duration,
    retry_budget: u32,
}

impl MemoryLockManager {
    pub fn new(retry_delay: Duration, retry_budget: u32) -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
            retry_delay,
            retry_budget,
        }
    }

    /// Attempt to claim the resource; returns the token on success.
    fn claim(&self, resource: &str, lease: Duration) -> Option<u64> {
        let token = rand::random::<u64>();
        let now = Instant::now();
        match self.locks.entry(resource.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if occupied.get().deadline > now {
                    return None;
                }
                // Expired lease: replaceable.
                occupied.insert(Held {
                    token,
                    deadline: now + lease,
                });
                Some(token)
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(Held {
                    token,
                    deadline: now + lease,
                });
                Some(token)
            }
        }
    }
}

impl Default for MemoryLockManager {
    fn default() -> Self {
        Self::new(Duration::from_millis(50), 40)
    }
}

struct MemoryLockHandle {
    locks: Arc<DashMap<String, Held>>,
    resource: String,
    token: u64,
}

#[async_trait]
impl LockHandle for MemoryLockHandle {
    async fn extend(&mut self, lease: Duration) -> Result<(), LockError> {
        let now = Instant::now();
        match self.locks.get_mut(&self.resource) {
            Some(mut held) if held.token == self.token && held.deadline > now => {
                held.deadline = now + lease;
                Ok(())
            }
            _ => Err(LockError::Lost(self.resource.clone())),
        }
    }

    async fn release(self: Box<Self>) -> Result<(), LockError> {
        self.locks
            .remove_if(&self.resource, |_, held| held.token == self.token);
        Ok(())
    }
}

#[async_trait]
impl LockManager for MemoryLockManager {
    async fn acquire(
        &self,
        resource: &str,
        lease: Duration,
    ) -> Result<Box<dyn LockHandle>, LockError> {
        for attempt in 0..=self.retry_budget {
            if let Some(token) = self.claim(resource, lease) {
                return Ok(Box::new(MemoryLockHandle {
                    locks: self.locks.clone(),
                    resource: resource.to_string(),
                    token,
                }));
            }
            if attempt < self.retry_budget {
                tokio::time::sleep(self.retry_delay).await;
            }
        }
        Err(LockError::Contended(resource.to_string()))
    }

    async fn try_acquire(
        &self,
        resource: &str,
        lease: Duration,
    ) -> Result<Option<Box<dyn LockHandle>>, LockError> {
        Ok(self.claim(resource, lease).map(|token| {
            Box::new(MemoryLockHandle {
                locks: self.locks.clone(),
                resource: resource.to_string(),
                token,
            }) as Box<dyn LockHandle>
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mutual_exclusion() {
        let manager = MemoryLockManager::new(Duration::from_millis(1), 2);
        let lease = Duration::from_secs(10);

        let held = manager.acquire("lock:table:t1", lease).await.unwrap();
        assert!(manager
            .try_acquire("lock:table:t1", lease)
            .await
            .unwrap()
            .is_none());

        // A different resource is independent
        assert!(manager
            .try_acquire("lock:table:t2", lease)
            .await
            .unwrap()
            .is_some());

        held.release().await.unwrap();
        assert!(manager
            .try_acquire("lock:table:t1", lease)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_acquire_exhausts_budget() {
        let manager = MemoryLockManager::new(Duration::from_millis(1), 3);
        let lease = Duration::from_secs(10);

        let _held = manager.acquire("lock:table:t1", lease).await.unwrap();
        let result = manager.acquire("lock:table:t1", lease).await;
        assert!(matches!(result, Err(LockError::Contended(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry_releases() {
        let manager = MemoryLockManager::default();
        let mut held = manager
            .acquire("lock:table:t1", Duration::from_secs(2))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(3)).await;

        // Expired lease is claimable by another holder...
        let second = manager
            .try_acquire("lock:table:t1", Duration::from_secs(10))
            .await
            .unwrap();
        assert!(second.is_some());

        // ...and the original holder can no longer extend.
        assert!(matches!(
            held.extend(Duration::from_secs(10)).await,
            Err(LockError::Lost(_))
        ));
    }

    #[tokio::test]
    async fn test_extend_keeps_lease() {
        let manager = MemoryLockManager::default();
        let mut held = manager
            .acquire("lock:table:t1", Duration::from_secs(10))
            .await
            .unwrap();
        held.extend(Duration::from_secs(10)).await.unwrap();
        held.release().await.unwrap();
    }
}
