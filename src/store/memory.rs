//! In-memory state store
//!
//! Backend for tests and single-node dev mode. Versioned snapshots live
//! in a `DashMap` with per-entry expiry; pub/sub is a tokio broadcast
//! channel shared by all subscribers.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::{EventSubscription, StateError, StateEvent, StateStore, TableSnapshot};

struct Entry {
    snapshot: TableSnapshot,
    expires_at: Instant,
}

struct KvEntry {
    value: String,
    expires_at: Instant,
}

pub struct MemoryStateStore {
    tables: DashMap<String, Entry>,
    kv: DashMap<String, KvEntry>,
    events: broadcast::Sender<StateEvent>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            tables: DashMap::new(),
            kv: DashMap::new(),
            events,
        }
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

struct MemorySubscription {
    rx: broadcast::Receiver<StateEvent>,
}

#[async_trait]
impl EventSubscription for MemorySubscription {
    async fn recv(&mut self) -> Option<StateEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                // Loss is tolerated: subscribers re-read canonical state.
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event subscription lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, table_id: &str) -> Result<Option<TableSnapshot>, StateError> {
        match self.tables.get(table_id) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.snapshot.clone())),
            Some(_) => {
                drop(self.tables.remove(table_id));
                Ok(None)
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
        // The dashmap entry guard makes the check-and-replace atomic
        // against concurrent writers of the same key.
        let entry = self.tables.entry(table_id.to_string());
        match entry {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let live = occupied.get().expires_at > Instant::now();
                match expected_version {
                    None if live => return Err(StateError::AlreadyExists(table_id.to_string())),
                    Some(expected) => {
                        if !live {
                            return Err(StateError::NotFound(table_id.to_string()));
                        }
                        if occupied.get().snapshot.version != expected {
                            return Err(StateError::VersionMismatch {
                                table_id: table_id.to_string(),
                                expected,
                            });
                        }
                    }
                    None => {}
                }
                occupied.insert(Entry {
                    snapshot: snapshot.clone(),
                    expires_at: Instant::now() + ttl,
                });
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                if expected_version.is_some() {
                    return Err(StateError::NotFound(table_id.to_string()));
                }
                vacant.insert(Entry {
                    snapshot: snapshot.clone(),
                    expires_at: Instant::now() + ttl,
                });
            }
        }
        Ok(())
    }

    async fn publish(&self, _table_id: &str, event: &StateEvent) -> Result<(), StateError> {
        // Send fails only when no subscriber exists, which is fine.
        let _ = self.events.send(event.clone());
        Ok(())
    }

    async fn subscribe_all(&self) -> Result<Box<dyn EventSubscription>, StateError> {
        Ok(Box::new(MemorySubscription {
            rx: self.events.subscribe(),
        }))
    }

    async fn kv_get(&self, key: &str) -> Result<Option<String>, StateError> {
        match self.kv.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value.clone())),
            Some(_) => {
                drop(self.kv.remove(key));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn kv_set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StateError> {
        self.kv.insert(
            key.to_string(),
            KvEntry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn kv_set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StateError> {
        match self.kv.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at > Instant::now() {
                    return Ok(false);
                }
                occupied.insert(KvEntry {
                    value: value.to_string(),
                    expires_at: Instant::now() + ttl,
                });
                Ok(true)
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(KvEntry {
                    value: value.to_string(),
                    expires_at: Instant::now() + ttl,
                });
                Ok(true)
            }
        }
    }

    async fn kv_del(&self, key: &str) -> Result<(), StateError> {
        self.kv.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snap(version: u64) -> TableSnapshot {
        TableSnapshot::new(version, json!({"v": version}))
    }

    const TTL: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn test_create_then_cas() {
        let store = MemoryStateStore::new();

        store
            .compare_and_set("t1", None, &snap(0), TTL)
            .await
            .unwrap();
        assert_eq!(store.load("t1").await.unwrap().unwrap().version, 0);

        // Re-creating fails
        assert!(matches!(
            store.compare_and_set("t1", None, &snap(0), TTL).await,
            Err(StateError::AlreadyExists(_))
        ));

        // Correct expected version replaces
        store
            .compare_and_set("t1", Some(0), &snap(1), TTL)
            .await
            .unwrap();
        assert_eq!(store.load("t1").await.unwrap().unwrap().version, 1);

        // Stale expected version is rejected
        assert!(matches!(
            store.compare_and_set("t1", Some(0), &snap(2), TTL).await,
            Err(StateError::VersionMismatch { expected: 0, .. })
        ));
    }

    #[tokio::test]
    async fn test_cas_on_missing_table() {
        let store = MemoryStateStore::new();
        assert!(matches!(
            store.compare_and_set("nope", Some(3), &snap(4), TTL).await,
            Err(StateError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_ttl_expiry() {
        let store = MemoryStateStore::new();
        store
            .compare_and_set("t1", None, &snap(0), Duration::from_secs(5))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(store.load("t1").await.unwrap().is_none());

        // After expiry the table can be re-created at version 0
        store
            .compare_and_set("t1", None, &snap(0), TTL)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let store = MemoryStateStore::new();
        let mut sub = store.subscribe_all().await.unwrap();

        let event = StateEvent::StateUpdate {
            table_id: "t1".into(),
            version: 7,
        };
        store.publish("t1", &event).await.unwrap();

        assert_eq!(sub.recv().await.unwrap(), event);
    }

    #[tokio::test(start_paused = true)]
    async fn test_kv_nx_and_ttl() {
        let store = MemoryStateStore::new();

        assert!(store
            .kv_set_nx("k", "a", Duration::from_secs(10))
            .await
            .unwrap());
        assert!(!store
            .kv_set_nx("k", "b", Duration::from_secs(10))
            .await
            .unwrap());
        assert_eq!(store.kv_get("k").await.unwrap().as_deref(), Some("a"));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.kv_get("k").await.unwrap(), None);
        assert!(store
            .kv_set_nx("k", "c", Duration::from_secs(10))
            .await
            .unwrap());

        store.kv_del("k").await.unwrap();
        assert_eq!(store.kv_get("k").await.unwrap(), None);
    }
}
