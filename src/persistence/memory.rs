//! In-memory cold store for tests and dev mode.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use super::{ColdStore, PersistError, TableRecord, TableStatus};
use crate::core_types::HandId;

#[derive(Default)]
struct Inner {
    tables: HashMap<String, TableRecord>,
    hand_histories: Vec<(String, HandId, Value)>,
}

#[derive(Default)]
pub struct MemoryColdStore {
    inner: Mutex<Inner>,
}

impl MemoryColdStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ColdStore for MemoryColdStore {
    async fn upsert_table(&self, record: &TableRecord) -> Result<(), PersistError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .tables
            .insert(record.table_id.clone(), record.clone());
        Ok(())
    }

    async fn set_table_status(
        &self,
        table_id: &str,
        status: TableStatus,
    ) -> Result<(), PersistError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.tables.get_mut(table_id) {
            record.status = status;
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn load_table(&self, table_id: &str) -> Result<Option<TableRecord>, PersistError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.tables.get(table_id).cloned())
    }

    async fn insert_hand_history(
        &self,
        table_id: &str,
        hand_id: HandId,
        data: &Value,
    ) -> Result<(), PersistError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .hand_histories
            .push((table_id.to_string(), hand_id, data.clone()));
        Ok(())
    }

    async fn hand_history_count(&self, table_id: &str) -> Result<u64, PersistError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .hand_histories
            .iter()
            .filter(|(t, _, _)| t == table_id)
            .count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableConfig;
    use serde_json::json;

    #[tokio::test]
    async fn test_upsert_and_status() {
        let store = MemoryColdStore::new();
        let record = TableRecord {
            table_id: "t1".into(),
            config: TableConfig::cash(5, 10, 6),
            state: json!({"_version": 3}),
            status: TableStatus::Active,
            updated_at: Utc::now(),
        };
        store.upsert_table(&record).await.unwrap();
        store
            .set_table_status("t1", TableStatus::Waiting)
            .await
            .unwrap();

        let loaded = store.load_table("t1").await.unwrap().unwrap();
        assert_eq!(loaded.status, TableStatus::Waiting);
        assert_eq!(loaded.state["_version"], 3);
    }

    #[tokio::test]
    async fn test_hand_history_count() {
        let store = MemoryColdStore::new();
        store
            .insert_hand_history("t1", 10, &json!({"winner": 1}))
            .await
            .unwrap();
        store
            .insert_hand_history("t1", 11, &json!({"winner": 2}))
            .await
            .unwrap();
        store
            .insert_hand_history("t2", 12, &json!({}))
            .await
            .unwrap();
        assert_eq!(store.hand_history_count("t1").await.unwrap(), 2);
        assert_eq!(store.hand_history_count("t2").await.unwrap(), 1);
    }
}
