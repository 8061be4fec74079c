//! Next-Hand Worker (C8)
//!
//! Re-enters the orchestrator contract to auto-deal after the grace
//! delay. Idempotent against a manual deal: lock contention or a
//! snapshot that already moved past the completed hand are silent exits.
//! When fewer than two players hold chips the table is marked WAITING.

use std::sync::Arc;

use async_trait::async_trait;

use super::NextHandJob;
use crate::orchestrator::{NextHandOutcome, Orchestrator};
use crate::persistence::{ColdStore, TableStatus};
use crate::queue::{Job, JobHandler};

pub struct NextHandWorker {
    orchestrator: Arc<Orchestrator>,
    cold: Arc<dyn ColdStore>,
}

impl NextHandWorker {
    pub fn new(orchestrator: Arc<Orchestrator>, cold: Arc<dyn ColdStore>) -> Self {
        Self { orchestrator, cold }
    }
}

#[async_trait]
impl JobHandler for NextHandWorker {
    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        let payload: NextHandJob = serde_json::from_value(job.payload.clone())?;
        match self.orchestrator.auto_deal(&payload.table_id).await? {
            NextHandOutcome::Dealt(_) => {}
            NextHandOutcome::NotEnoughPlayers => {
                tracing::info!(table_id = %payload.table_id, "fewer than two stacks; table back to waiting");
                self.cold
                    .set_table_status(&payload.table_id, TableStatus::Waiting)
                    .await?;
            }
            NextHandOutcome::ManualDealWon
            | NextHandOutcome::HandNotComplete
            | NextHandOutcome::TableGone => {}
        }
        Ok(())
    }
}
