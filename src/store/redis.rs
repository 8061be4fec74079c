//! Redis state store
//!
//! Production backend. The compare-and-set is a Lua script so the
//! version check and the replacement are one atomic server-side step;
//! pub/sub uses one pattern subscription over `table:*` per process.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use once_cell::sync::Lazy;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use super::{
    EventSubscription, StateError, StateEvent, StateStore, TableSnapshot, table_channel, table_key,
};

// Return codes: 0 ok, -1 no snapshot, -2 already exists, -3 version mismatch.
// ARGV[1] = expected version or "-1" for create, ARGV[2] = snapshot JSON,
// ARGV[3] = ttl millis.
static CAS_SCRIPT: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '-1' then
    if current then return -2 end
    redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
    return 0
end
if not current then return -1 end
local decoded = cjson.decode(current)
if decoded['_version'] ~= tonumber(ARGV[1]) then return -3 end
redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
return 0
"#,
    )
});

pub struct RedisStateStore {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisStateStore {
    pub async fn connect(url: &str) -> Result<Self, StateError> {
        let client = redis::Client::open(url).map_err(backend)?;
        let conn = ConnectionManager::new(client.clone()).await.map_err(backend)?;
        Ok(Self { client, conn })
    }
}

fn backend(e: redis::RedisError) -> StateError {
    StateError::Backend(e.to_string())
}

struct RedisSubscription {
    messages: Pin<Box<dyn Stream<Item = redis::Msg> + Send>>,
}

#[async_trait]
impl EventSubscription for RedisSubscription {
    async fn recv(&mut self) -> Option<StateEvent> {
        loop {
            let msg = self.messages.next().await?;
            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(error = %e, "unreadable pub/sub payload");
                    continue;
                }
            };
            match serde_json::from_str::<StateEvent>(&payload) {
                Ok(event) => return Some(event),
                Err(e) => {
                    tracing::warn!(error = %e, "malformed state event; dropping");
                    continue;
                }
            }
        }
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn load(&self, table_id: &str) -> Result<Option<TableSnapshot>, StateError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(table_key(table_id)).await.map_err(backend)?;
        match raw {
            Some(raw) => {
                let snapshot = serde_json::from_str(&raw)
                    .map_err(|e| StateError::Backend(format!("corrupt snapshot: {}", e)))?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    async fn compare_and_set(
        &self,
        table_id: &str,
        expected_version: Option<u64>,
        snapshot: &TableSnapshot,
        ttl: Duration,
    ) -> Result<(), StateError> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(snapshot)
            .map_err(|e| StateError::Backend(format!("unserializable snapshot: {}", e)))?;
        let expected = match expected_version {
            Some(v) => v.to_string(),
            None => "-1".to_string(),
        };
        let code: i64 = CAS_SCRIPT
            .key(table_key(table_id))
            .arg(expected)
            .arg(payload)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        match code {
            0 => Ok(()),
            -1 => Err(StateError::NotFound(table_id.to_string())),
            -2 => Err(StateError::AlreadyExists(table_id.to_string())),
            -3 => Err(StateError::VersionMismatch {
                table_id: table_id.to_string(),
                expected: expected_version.unwrap_or_default(),
            }),
            other => Err(StateError::Backend(format!(
                "unexpected CAS script result {}",
                other
            ))),
        }
    }

    async fn publish(&self, table_id: &str, event: &StateEvent) -> Result<(), StateError> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(event)
            .map_err(|e| StateError::Backend(format!("unserializable event: {}", e)))?;
        let _: i64 = conn
            .publish(table_channel(table_id), payload)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn subscribe_all(&self) -> Result<Box<dyn EventSubscription>, StateError> {
        let conn = self
            .client
            .get_async_connection()
            .await
            .map_err(backend)?;
        let mut pubsub = conn.into_pubsub();
        pubsub.psubscribe("table:*").await.map_err(backend)?;
        Ok(Box::new(RedisSubscription {
            messages: Box::pin(pubsub.into_on_message()),
        }))
    }

    async fn kv_get(&self, key: &str) -> Result<Option<String>, StateError> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(backend)
    }

    async fn kv_set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StateError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .pset_ex(key, value, ttl.as_millis() as u64)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn kv_set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StateError> {
        let mut conn = self.conn.clone();
        let claimed: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(claimed.is_some())
    }

    async fn kv_del(&self, key: &str) -> Result<(), StateError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(key).await.map_err(backend)?;
        Ok(())
    }
}
