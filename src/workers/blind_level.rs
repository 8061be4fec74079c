//! Blind-Level Worker
//!
//! Repeatable schedule for tournament tables: applies NEXT_BLIND_LEVEL
//! through the normal orchestrator contract at the configured cadence.
//! A rejection from the engine (table already at the last level, or the
//! level cannot change mid-hand) is a normal outcome, not a failure.

use std::sync::Arc;

use async_trait::async_trait;

use super::BlindLevelJob;
use crate::engine::Action;
use crate::error::CoreError;
use crate::orchestrator::{Actor, Orchestrator};
use crate::queue::{Job, JobHandler};

pub struct BlindLevelWorker {
    orchestrator: Arc<Orchestrator>,
}

impl BlindLevelWorker {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl JobHandler for BlindLevelWorker {
    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        let payload: BlindLevelJob = serde_json::from_value(job.payload.clone())?;
        match self
            .orchestrator
            .process_action(&payload.table_id, Action::next_blind_level(), Actor::System)
            .await
        {
            Ok(view) => {
                tracing::info!(table_id = %payload.table_id, version = view.version, "blind level advanced");
                Ok(())
            }
            Err(CoreError::EngineInvalid { code, .. }) => {
                tracing::debug!(table_id = %payload.table_id, code = %code, "blind level not advanced");
                Ok(())
            }
            Err(CoreError::TableNotFound(_)) => {
                tracing::info!(table_id = %payload.table_id, "blind level schedule for missing table");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
