//! Job Queue - deferred work items (C4)
//!
//! Immediate and delayed jobs with singleton-by-id semantics and
//! repeatable schedules. Delivery is at-least-once with retry and
//! exponential backoff; handlers must be idempotent. A job whose
//! `unique_id` matches a pending or delayed job is dropped at enqueue -
//! the mechanism that ties timers and next-hand scheduling to a specific
//! snapshot version.

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::error::CoreError;

pub use memory::MemoryJobQueue;

/// Queue names consumed by the worker pipeline.
pub mod queues {
    pub const PERSIST_SNAPSHOT: &str = "persist-snapshot";
    pub const SETTLE_HAND: &str = "settle-hand";
    pub const ARCHIVE_HAND: &str = "archive-hand";
    pub const NEXT_HAND: &str = "next-hand";
    pub const PLAYER_TIMEOUT: &str = "player-timeout";
    pub const BLIND_LEVEL: &str = "blind-level";
}

#[derive(Error, Debug, Clone)]
pub enum QueueError {
    #[error("queue closed")]
    Closed,

    #[error("queue backend error: {0}")]
    Backend(String),
}

impl From<QueueError> for CoreError {
    fn from(e: QueueError) -> Self {
        CoreError::Queue(e.to_string())
    }
}

/// One work item, owned by its consumer from acquisition to completion.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: u64,
    pub queue: String,
    pub name: String,
    pub payload: Value,
    pub unique_id: Option<String>,
    pub repeat_every: Option<Duration>,
    /// 1-based delivery attempt.
    pub attempt: u32,
}

#[derive(Debug, Clone, Default)]
pub struct JobOpts {
    pub delay: Option<Duration>,
    pub unique_id: Option<String>,
    pub repeat_every: Option<Duration>,
}

impl JobOpts {
    pub fn immediate() -> Self {
        Self::default()
    }

    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn singleton(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = Some(unique_id.into());
        self
    }

    pub fn repeating(mut self, every: Duration) -> Self {
        self.repeat_every = Some(every);
        self
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> anyhow::Result<()>;
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job. A no-op when `opts.unique_id` matches a job that is
    /// still pending or delayed.
    async fn enqueue(
        &self,
        queue: &str,
        name: &str,
        payload: Value,
        opts: JobOpts,
    ) -> Result<(), QueueError>;

    /// Register a consumer for a queue with the given concurrency.
    fn register(&self, queue: &str, concurrency: usize, handler: Arc<dyn JobHandler>);

    /// Stop consumers after their current job and wait for them.
    async fn close(&self);
}
