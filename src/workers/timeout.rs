//! Timeout Worker (C7)
//!
//! Thin queue adapter over [`Orchestrator::process_timeout`]: the
//! version check and the fold itself live in the orchestrator so the
//! commit pipeline is shared with normal actions.

use std::sync::Arc;

use async_trait::async_trait;

use super::PlayerTimeoutJob;
use crate::orchestrator::Orchestrator;
use crate::queue::{Job, JobHandler};

pub struct TimeoutWorker {
    orchestrator: Arc<Orchestrator>,
}

impl TimeoutWorker {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl JobHandler for TimeoutWorker {
    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        let payload: PlayerTimeoutJob = serde_json::from_value(job.payload.clone())?;
        // Superseded and table-gone outcomes are silent drops by design;
        // only backend failures bubble up into the retry machinery.
        self.orchestrator
            .process_timeout(
                &payload.table_id,
                payload.player_id,
                payload.expected_version,
            )
            .await?;
        Ok(())
    }
}
