//! Persist Worker (C9)
//!
//! Write-behind snapshot persistence. The hot store stays canonical;
//! this worker only keeps the cold store close enough for cold-start
//! recovery.

use std::sync::Arc;

use async_trait::async_trait;

use super::PersistSnapshotJob;
use crate::persistence::{ColdStore, TableRecord};
use crate::queue::{Job, JobHandler};

pub struct PersistWorker {
    cold: Arc<dyn ColdStore>,
}

impl PersistWorker {
    pub fn new(cold: Arc<dyn ColdStore>) -> Self {
        Self { cold }
    }
}

#[async_trait]
impl JobHandler for PersistWorker {
    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        let payload: PersistSnapshotJob = serde_json::from_value(job.payload.clone())?;
        let record = TableRecord {
            table_id: payload.table_id,
            config: payload.config,
            state: serde_json::to_value(&payload.snapshot)?,
            status: payload.status,
            updated_at: chrono::Utc::now(),
        };
        self.cold.upsert_table(&record).await?;
        Ok(())
    }
}
