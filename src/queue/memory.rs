//! In-process job queue
//!
//! Per-queue ready deque + delayed set, tokio tasks as consumers.
//! Singleton ids are held from enqueue until the job goes active, so a
//! duplicate enqueue while the original is pending or delayed is a
//! no-op. Failed jobs are re-enqueued with exponential backoff up to
//! `max_attempts`; terminal failures are logged and alert-worthy, never
//! auto-compensated.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rustc_hash::FxHashSet;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{Job, JobHandler, JobOpts, JobQueue, QueueError};
use crate::config::WorkerConfig;
use crate::shutdown::ShutdownSignal;

struct QueueState {
    inner: std::sync::Mutex<QueueInner>,
    notify: Notify,
}

#[derive(Default)]
struct QueueInner {
    ready: VecDeque<Job>,
    delayed: Vec<(Instant, Job)>,
    unique: FxHashSet<String>,
}

impl QueueState {
    fn new() -> Self {
        Self {
            inner: std::sync::Mutex::new(QueueInner::default()),
            notify: Notify::new(),
        }
    }

    fn try_pop(&self) -> Option<Job> {
        let mut inner = self.inner.lock().unwrap();
        let job = inner.ready.pop_front()?;
        // The singleton id guards pending/delayed only; once active, a
        // fresh enqueue with the same id must be accepted.
        if let Some(unique_id) = &job.unique_id {
            inner.unique.remove(unique_id);
        }
        Some(job)
    }
}

struct Shared {
    queues: DashMap<String, Arc<QueueState>>,
    next_job_id: AtomicU64,
    worker_cfg: WorkerConfig,
    shutdown: ShutdownSignal,
    consumers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn queue(&self, name: &str) -> Arc<QueueState> {
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(QueueState::new()))
            .clone()
    }
}

/// Snapshot of one not-yet-active job, for operator introspection.
#[derive(Debug, Clone)]
pub struct PendingJobInfo {
    pub name: String,
    pub payload: Value,
    pub unique_id: Option<String>,
    /// Remaining delay; `None` when the job is already runnable.
    pub delay_remaining: Option<Duration>,
}

pub struct MemoryJobQueue {
    shared: Arc<Shared>,
}

impl MemoryJobQueue {
    pub fn new(worker_cfg: WorkerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                queues: DashMap::new(),
                next_job_id: AtomicU64::new(1),
                worker_cfg,
                shutdown: ShutdownSignal::new(),
                consumers: std::sync::Mutex::new(Vec::new()),
            }),
        }
    }

    /// Pending and delayed jobs on a queue; debugging/ops surface.
    pub fn pending_jobs(&self, queue: &str) -> Vec<PendingJobInfo> {
        let state = self.shared.queue(queue);
        let inner = state.inner.lock().unwrap();
        let now = Instant::now();
        let mut jobs: Vec<PendingJobInfo> = inner
            .ready
            .iter()
            .map(|job| PendingJobInfo {
                name: job.name.clone(),
                payload: job.payload.clone(),
                unique_id: job.unique_id.clone(),
                delay_remaining: None,
            })
            .collect();
        jobs.extend(inner.delayed.iter().map(|(due, job)| PendingJobInfo {
            name: job.name.clone(),
            payload: job.payload.clone(),
            unique_id: job.unique_id.clone(),
            delay_remaining: Some(due.saturating_duration_since(now)),
        }));
        jobs
    }

    fn schedule(shared: &Arc<Shared>, queue_name: &str, job: Job, delay: Option<Duration>) {
        let state = shared.queue(queue_name);
        match delay {
            Some(delay) if !delay.is_zero() => {
                let due = Instant::now() + delay;
                let job_id = job.id;
                {
                    let mut inner = state.inner.lock().unwrap();
                    inner.delayed.push((due, job));
                }
                let state = state.clone();
                tokio::spawn(async move {
                    tokio::time::sleep_until(due).await;
                    let promoted = {
                        let mut inner = state.inner.lock().unwrap();
                        match inner.delayed.iter().position(|(_, j)| j.id == job_id) {
                            Some(idx) => {
                                let (_, job) = inner.delayed.swap_remove(idx);
                                inner.ready.push_back(job);
                                true
                            }
                            None => false,
                        }
                    };
                    if promoted {
                        state.notify.notify_one();
                    }
                });
            }
            _ => {
                {
                    let mut inner = state.inner.lock().unwrap();
                    inner.ready.push_back(job);
                }
                state.notify.notify_one();
            }
        }
    }

    async fn next_job(state: &QueueState) -> Job {
        loop {
            let notified = state.notify.notified();
            if let Some(job) = state.try_pop() {
                return job;
            }
            notified.await;
        }
    }

    async fn run_job(shared: &Arc<Shared>, handler: &Arc<dyn JobHandler>, job: Job) {
        match handler.handle(&job).await {
            Ok(()) => {
                tracing::debug!(
                    queue = %job.queue,
                    job = %job.name,
                    attempt = job.attempt,
                    "job completed"
                );
                if let Some(every) = job.repeat_every {
                    if shared.shutdown.is_requested() {
                        return;
                    }
                    let next = Job {
                        id: shared.next_job_id.fetch_add(1, Ordering::Relaxed),
                        attempt: 1,
                        ..job
                    };
                    let queue_name = next.queue.clone();
                    if let Some(unique_id) = &next.unique_id {
                        let state = shared.queue(&queue_name);
                        let mut inner = state.inner.lock().unwrap();
                        if !inner.unique.insert(unique_id.clone()) {
                            return;
                        }
                    }
                    Self::schedule(shared, &queue_name, next, Some(every));
                }
            }
            Err(error) => {
                let max_attempts = shared.worker_cfg.max_attempts;
                if job.attempt < max_attempts && !shared.shutdown.is_requested() {
                    let backoff = backoff_delay(&shared.worker_cfg, job.attempt);
                    tracing::warn!(
                        queue = %job.queue,
                        job = %job.name,
                        attempt = job.attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %error,
                        "job failed; retrying"
                    );
                    let retry = Job {
                        id: shared.next_job_id.fetch_add(1, Ordering::Relaxed),
                        attempt: job.attempt + 1,
                        ..job
                    };
                    let queue_name = retry.queue.clone();
                    // Re-claim the singleton id for the retry; if a fresh
                    // job took it meanwhile, that job supersedes the retry.
                    if let Some(unique_id) = &retry.unique_id {
                        let state = shared.queue(&queue_name);
                        let mut inner = state.inner.lock().unwrap();
                        if !inner.unique.insert(unique_id.clone()) {
                            return;
                        }
                    }
                    Self::schedule(shared, &queue_name, retry, Some(backoff));
                } else {
                    tracing::error!(
                        queue = %job.queue,
                        job = %job.name,
                        attempt = job.attempt,
                        error = %error,
                        "job failed terminally; manual requeue required"
                    );
                }
            }
        }
    }
}

fn backoff_delay(cfg: &WorkerConfig, attempt: u32) -> Duration {
    let factor = 1u64 << (attempt.min(16) - 1).min(16);
    let millis = cfg.backoff_base_ms.saturating_mul(factor);
    Duration::from_millis(millis.min(cfg.backoff_max_ms))
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(
        &self,
        queue: &str,
        name: &str,
        payload: Value,
        opts: JobOpts,
    ) -> Result<(), QueueError> {
        if self.shared.shutdown.is_requested() {
            return Err(QueueError::Closed);
        }
        let state = self.shared.queue(queue);
        if let Some(unique_id) = &opts.unique_id {
            let mut inner = state.inner.lock().unwrap();
            if !inner.unique.insert(unique_id.clone()) {
                tracing::debug!(queue, job = name, unique_id = %unique_id, "singleton exists; dropped");
                return Ok(());
            }
        }
        let job = Job {
            id: self.shared.next_job_id.fetch_add(1, Ordering::Relaxed),
            queue: queue.to_string(),
            name: name.to_string(),
            payload,
            unique_id: opts.unique_id,
            repeat_every: opts.repeat_every,
            attempt: 1,
        };
        Self::schedule(&self.shared, queue, job, opts.delay);
        Ok(())
    }

    fn register(&self, queue: &str, concurrency: usize, handler: Arc<dyn JobHandler>) {
        let state = self.shared.queue(queue);
        let mut handles = Vec::with_capacity(concurrency);
        for _ in 0..concurrency.max(1) {
            let shared = self.shared.clone();
            let state = state.clone();
            let handler = handler.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let job = tokio::select! {
                        biased;
                        _ = shared.shutdown.wait() => break,
                        job = MemoryJobQueue::next_job(&state) => job,
                    };
                    // The current job always runs to completion; shutdown
                    // is only observed between jobs.
                    MemoryJobQueue::run_job(&shared, &handler, job).await;
                }
            }));
        }
        self.shared.consumers.lock().unwrap().extend(handles);
    }

    async fn close(&self) {
        self.shared.shutdown.request();
        let handles: Vec<_> = {
            let mut consumers = self.shared.consumers.lock().unwrap();
            consumers.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    struct Recorder {
        runs: AtomicU32,
        fail_first: u32,
    }

    impl Recorder {
        fn new(fail_first: u32) -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicU32::new(0),
                fail_first,
            })
        }

        fn count(&self) -> u32 {
            self.runs.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl JobHandler for Recorder {
        async fn handle(&self, _job: &Job) -> anyhow::Result<()> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst);
            if run < self.fail_first {
                anyhow::bail!("induced failure {}", run);
            }
            Ok(())
        }
    }

    fn test_queue() -> MemoryJobQueue {
        MemoryJobQueue::new(WorkerConfig {
            concurrency: 1,
            max_attempts: 3,
            backoff_base_ms: 10,
            backoff_max_ms: 100,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_job_runs() {
        let queue = test_queue();
        let recorder = Recorder::new(0);
        queue.register("q", 1, recorder.clone());

        queue
            .enqueue("q", "noop", json!({}), JobOpts::immediate())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(recorder.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_singleton_collapses_duplicates() {
        let queue = test_queue();
        let recorder = Recorder::new(0);
        queue.register("q", 1, recorder.clone());

        for _ in 0..3 {
            queue
                .enqueue(
                    "q",
                    "timer",
                    json!({}),
                    JobOpts::delayed(Duration::from_secs(2)).singleton("timeout:t1:0:5"),
                )
                .await
                .unwrap();
        }
        assert_eq!(queue.pending_jobs("q").len(), 1);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(recorder.count(), 1);

        // Once the job went active the id is free again
        queue
            .enqueue(
                "q",
                "timer",
                json!({}),
                JobOpts::immediate().singleton("timeout:t1:0:5"),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(recorder.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_is_honored() {
        let queue = test_queue();
        let recorder = Recorder::new(0);
        queue.register("q", 1, recorder.clone());

        queue
            .enqueue(
                "q",
                "later",
                json!({}),
                JobOpts::delayed(Duration::from_secs(5)),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(recorder.count(), 0);
        let pending = queue.pending_jobs("q");
        assert_eq!(pending.len(), 1);
        assert!(pending[0].delay_remaining.unwrap() <= Duration::from_secs(1));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(recorder.count(), 1);
        assert!(queue.pending_jobs("q").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_backoff_then_success() {
        let queue = test_queue();
        let recorder = Recorder::new(2);
        queue.register("q", 1, recorder.clone());

        queue
            .enqueue("q", "flaky", json!({}), JobOpts::immediate())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        // attempt 1 fails, attempt 2 fails, attempt 3 succeeds
        assert_eq!(recorder.count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_failure_stops_retrying() {
        let queue = test_queue();
        let recorder = Recorder::new(u32::MAX);
        queue.register("q", 1, recorder.clone());

        queue
            .enqueue("q", "doomed", json!({}), JobOpts::immediate())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(recorder.count(), 3); // max_attempts
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeating_job_rearms() {
        let queue = test_queue();
        let recorder = Recorder::new(0);
        queue.register("q", 1, recorder.clone());

        queue
            .enqueue(
                "q",
                "tick",
                json!({}),
                JobOpts::immediate().repeating(Duration::from_secs(10)),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(recorder.count(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(recorder.count(), 2);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(recorder.count(), 3);
    }

    #[tokio::test]
    async fn test_close_waits_for_consumers() {
        let queue = test_queue();
        let recorder = Recorder::new(0);
        queue.register("q", 2, recorder.clone());
        tokio::task::yield_now().await;

        queue
            .enqueue("q", "noop", json!({}), JobOpts::immediate())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        queue.close().await;
        assert!(matches!(
            queue
                .enqueue("q", "late", json!({}), JobOpts::immediate())
                .await,
            Err(QueueError::Closed)
        ));
    }
}
