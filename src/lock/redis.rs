//! Redis lock manager
//!
//! SET NX PX with a random holder token; extend and release are Lua
//! scripts that verify the token so a holder whose lease expired cannot
//! touch a lock that was taken over. Correctness assumes synchronized
//! clocks with small drift across nodes.

use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;

use super::{LockError, LockHandle, LockManager};

static EXTEND_SCRIPT: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#,
    )
});

static RELEASE_SCRIPT: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#,
    )
});

pub struct RedisLockManager {
    conn: ConnectionManager,
    retry_delay: Duration,
    retry_budget: u32,
}

impl RedisLockManager {
    pub fn new(conn: ConnectionManager, retry_delay: Duration, retry_budget: u32) -> Self {
        Self {
            conn,
            retry_delay,
            retry_budget,
        }
    }

    pub async fn connect(
        url: &str,
        retry_delay: Duration,
        retry_budget: u32,
    ) -> Result<Self, LockError> {
        let client = redis::Client::open(url).map_err(backend)?;
        let conn = ConnectionManager::new(client).await.map_err(backend)?;
        Ok(Self::new(conn, retry_delay, retry_budget))
    }

    async fn claim(&self, resource: &str, lease: Duration) -> Result<Option<u64>, LockError> {
        let token = rand::random::<u64>();
        let mut conn = self.conn.clone();
        let claimed: Option<String> = redis::cmd("SET")
            .arg(resource)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(lease.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(claimed.map(|_| token))
    }

    fn handle(&self, resource: &str, token: u64) -> Box<dyn LockHandle> {
        Box::new(RedisLockHandle {
            conn: self.conn.clone(),
            resource: resource.to_string(),
            token,
        })
    }
}

fn backend(e: redis::RedisError) -> LockError {
    LockError::Backend(e.to_string())
}

struct RedisLockHandle {
    conn: ConnectionManager,
    resource: String,
    token: u64,
}

#[async_trait]
impl LockHandle for RedisLockHandle {
    async fn extend(&mut self, lease: Duration) -> Result<(), LockError> {
        let mut conn = self.conn.clone();
        let extended: i64 = EXTEND_SCRIPT
            .key(&self.resource)
            .arg(self.token.to_string())
            .arg(lease.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        if extended == 1 {
            Ok(())
        } else {
            Err(LockError::Lost(self.resource.clone()))
        }
    }

    async fn release(self: Box<Self>) -> Result<(), LockError> {
        let mut conn = self.conn.clone();
        let _: i64 = RELEASE_SCRIPT
            .key(&self.resource)
            .arg(self.token.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(())
    }
}

#[async_trait]
impl LockManager for RedisLockManager {
    async fn acquire(
        &self,
        resource: &str,
        lease: Duration,
    ) -> Result<Box<dyn LockHandle>, LockError> {
        for attempt in 0..=self.retry_budget {
            if let Some(token) = self.claim(resource, lease).await? {
                return Ok(self.handle(resource, token));
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
        Ok(self
            .claim(resource, lease)
            .await?
            .map(|token| self.handle(resource, token)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn create_test_manager() -> Option<RedisLockManager> {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/".to_string());
        RedisLockManager::connect(&url, Duration::from_millis(20), 5)
            .await
            .ok()
    }

    #[tokio::test]
    async fn test_redis_lock_exclusion_and_release() {
        let manager = match create_test_manager().await {
            Some(m) => m,
            None => {
                eprintln!("Skipping test - redis not available");
                return;
            }
        };
        let resource = format!("lock:test:{}", rand::random::<u64>());
        let lease = Duration::from_secs(5);

        let held = manager.acquire(&resource, lease).await.unwrap();
        assert!(manager.try_acquire(&resource, lease).await.unwrap().is_none());

        held.release().await.unwrap();
        let reclaimed = manager.try_acquire(&resource, lease).await.unwrap();
        assert!(reclaimed.is_some());
        reclaimed.unwrap().release().await.unwrap();
    }
}
