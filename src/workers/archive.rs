//! Archive Worker (C9)
//!
//! Exports the completed hand's history from the engine and inserts the
//! hand-history row. Runs off the snapshot carried in the job payload,
//! not the live table, so later actions cannot race it.

use std::sync::Arc;

use async_trait::async_trait;

use super::ArchiveHandJob;
use crate::engine::{EngineFactory, HistoryFormat};
use crate::persistence::ColdStore;
use crate::queue::{Job, JobHandler};

pub struct ArchiveWorker {
    cold: Arc<dyn ColdStore>,
    engines: Arc<dyn EngineFactory>,
}

impl ArchiveWorker {
    pub fn new(cold: Arc<dyn ColdStore>, engines: Arc<dyn EngineFactory>) -> Self {
        Self { cold, engines }
    }
}

#[async_trait]
impl JobHandler for ArchiveWorker {
    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        let payload: ArchiveHandJob = serde_json::from_value(job.payload.clone())?;
        let engine = self.engines.restore(&payload.snapshot)?;
        let data = engine.history(HistoryFormat::Json);
        self.cold
            .insert_hand_history(&payload.table_id, payload.hand_id, &data)
            .await?;
        tracing::debug!(
            table_id = %payload.table_id,
            hand_id = payload.hand_id,
            "hand history archived"
        );
        Ok(())
    }
}
