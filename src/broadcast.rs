//! Broadcast Multiplexer (C10)
//!
//! One pattern subscription per process over every table channel. Events
//! carry only a version; on receipt the multiplexer re-reads canonical
//! state once, restores one engine, and pushes a per-connection masked
//! view to every registered client of that table.
//!
//! Fan-out fairness: each connection owns a bounded buffer with
//! drop-oldest overflow, so a slow client loses intermediate versions
//! (at-most-one-version-behind is acceptable) instead of blocking the
//! subscription or its neighbors.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::Notify;

use crate::core_types::{TableId, UserId, Version};
use crate::engine::{EngineFactory, MaskedView};
use crate::shutdown::ShutdownSignal;
use crate::store::{StateEvent, StateStore};

pub type ConnectionId = u64;

const DEFAULT_BUFFER: usize = 32;

struct ConnInner {
    buf: std::sync::Mutex<VecDeque<MaskedView>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl ConnInner {
    fn push(&self, view: MaskedView) {
        {
            let mut buf = self.buf.lock().unwrap();
            if buf.len() == self.capacity {
                buf.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            buf.push_back(view);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

/// Client end of a registered connection.
pub struct ViewReceiver {
    inner: Arc<ConnInner>,
}

impl ViewReceiver {
    /// Next masked view; `None` once unregistered and drained.
    pub async fn recv(&mut self) -> Option<MaskedView> {
        loop {
            let notified = self.inner.notify.notified();
            if let Some(view) = self.inner.buf.lock().unwrap().pop_front() {
                return Some(view);
            }
            if self.inner.closed.load(Ordering::SeqCst) {
                return None;
            }
            notified.await;
        }
    }

    /// Views lost to buffer overflow so far.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for ViewReceiver {
    fn drop(&mut self) {
        // The fan-out prunes closed connections on the next event.
        self.inner.close();
    }
}

#[derive(Clone)]
struct Registration {
    conn_id: ConnectionId,
    user_id: Option<UserId>,
    sink: Arc<ConnInner>,
}

pub struct BroadcastMux {
    state: Arc<dyn StateStore>,
    engines: Arc<dyn EngineFactory>,
    /// table_id -> connections interested in that table
    connections: DashMap<TableId, Vec<Registration>>,
    next_conn_id: AtomicU64,
}

impl BroadcastMux {
    pub fn new(state: Arc<dyn StateStore>, engines: Arc<dyn EngineFactory>) -> Self {
        Self {
            state,
            engines,
            connections: DashMap::new(),
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub fn register(
        &self,
        table_id: &str,
        user_id: Option<UserId>,
    ) -> (ConnectionId, ViewReceiver) {
        self.register_with_capacity(table_id, user_id, DEFAULT_BUFFER)
    }

    pub fn register_with_capacity(
        &self,
        table_id: &str,
        user_id: Option<UserId>,
        capacity: usize,
    ) -> (ConnectionId, ViewReceiver) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::new(ConnInner {
            buf: std::sync::Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });
        self.connections
            .entry(table_id.to_string())
            .or_default()
            .push(Registration {
                conn_id,
                user_id,
                sink: inner.clone(),
            });
        tracing::debug!(table_id, conn_id, "broadcast connection registered");
        (conn_id, ViewReceiver { inner })
    }

    pub fn unregister(&self, table_id: &str, conn_id: ConnectionId) {
        if let Some(mut conns) = self.connections.get_mut(table_id) {
            conns.retain(|r| {
                if r.conn_id == conn_id {
                    r.sink.close();
                    false
                } else {
                    true
                }
            });
            if conns.is_empty() {
                drop(conns);
                self.connections.remove(table_id);
            }
        }
        tracing::debug!(table_id, conn_id, "broadcast connection removed");
    }

    /// (tables with listeners, total connections)
    pub fn stats(&self) -> (usize, usize) {
        let tables = self.connections.len();
        let total = self.connections.iter().map(|e| e.value().len()).sum();
        (tables, total)
    }

    /// Consume the pattern subscription until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: ShutdownSignal) {
        let mut subscription = match self.state.subscribe_all().await {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "broadcast subscription failed");
                return;
            }
        };
        tracing::info!("broadcast multiplexer subscribed to table:*");

        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                event = subscription.recv() => event,
            };
            match event {
                Some(StateEvent::StateUpdate { table_id, version }) => {
                    self.handle_update(&table_id, version).await;
                }
                None => {
                    tracing::warn!("broadcast subscription closed");
                    break;
                }
            }
        }
        tracing::info!("broadcast multiplexer stopped");
    }

    async fn handle_update(&self, table_id: &str, version: Version) {
        // Snapshot the registrations and prune dead connections first;
        // nothing below holds the map entry.
        let targets: Vec<Registration> = match self.connections.get_mut(table_id) {
            Some(mut conns) => {
                conns.retain(|r| !r.sink.closed.load(Ordering::SeqCst));
                conns.clone()
            }
            None => return,
        };
        if targets.is_empty() {
            return;
        }

        // One canonical read, one engine restore for all connections. The
        // state may already be past the published version; delivering the
        // newer view satisfies the "latest state seen" contract.
        let snapshot = match self.state.load(table_id).await {
            Ok(Some(s)) => s,
            Ok(None) => {
                tracing::warn!(table_id, version, "update for missing snapshot");
                return;
            }
            Err(e) => {
                tracing::warn!(table_id, version, error = %e, "state read failed; views skipped");
                return;
            }
        };
        let engine = match self.engines.restore(&snapshot) {
            Ok(e) => e,
            Err(e) => {
                tracing::error!(table_id, error = %e, "engine restore failed; views skipped");
                return;
            }
        };

        for registration in targets {
            let view = MaskedView {
                table_id: table_id.to_string(),
                version: snapshot.version,
                state: engine.view(registration.user_id),
            };
            registration.sink.push(view);
        }
    }
}
