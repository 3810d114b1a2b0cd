//! Multi-connection polling framework
//!
//! One [`PollingLoop`] drives one [`Poller`] across every registered
//! connection. The loop owns the schedule; the poller owns what a single
//! tick does against a single connection. Guarantees per loop:
//!
//! - ticks never overlap: a tick that fires while the previous one is
//!   still running is skipped and counted
//! - one connection failing never stops the fan-out to the others
//! - a connection that disappears from the registry gets exactly one
//!   `on_connection_removed` callback

use crate::error::Result;
use crate::registry::{ConnectionRegistry, LiveConnection};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

pub mod audit;
pub mod clients;
pub mod commandlog;
pub mod config_monitor;
pub mod slowlog;

pub use audit::AuditPoller;
pub use clients::ClientsPoller;
pub use commandlog::CommandLogPoller;
pub use config_monitor::ConfigMonitorPoller;
pub use slowlog::SlowLogPoller;

/// One feature's per-connection polling behavior
#[async_trait]
pub trait Poller: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Read fresh on every scheduling decision so runtime interval
    /// changes take effect without a restart
    fn interval(&self) -> Duration;

    async fn poll(&self, conn: &LiveConnection) -> Result<()>;

    /// Called exactly once when a connection leaves the registry
    async fn on_connection_removed(&self, connection_id: &str);

    /// Opt in to receive currently-disconnected connections
    fn include_disconnected(&self) -> bool {
        false
    }
}

/// Per-connection cursor arena
///
/// Each feature poller keeps its last-seen state here, keyed by connection
/// id, and wires [`ConnState::remove`] into `on_connection_removed` so
/// stale cursors never outlive their connection.
pub struct ConnState<T> {
    map: RwLock<HashMap<String, T>>,
}

impl<T: Clone> ConnState<T> {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, connection_id: &str) -> Option<T> {
        match self.map.read() {
            Ok(map) => map.get(connection_id).cloned(),
            Err(poisoned) => poisoned.into_inner().get(connection_id).cloned(),
        }
    }

    pub fn set(&self, connection_id: &str, value: T) {
        let mut map = match self.map.write() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.insert(connection_id.to_string(), value);
    }

    pub fn remove(&self, connection_id: &str) {
        let mut map = match self.map.write() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.remove(connection_id);
    }
}

impl<T: Clone> Default for ConnState<T> {
    fn default() -> Self {
        Self::new()
    }
}

struct LoopInner {
    registry: Arc<ConnectionRegistry>,
    poller: Arc<dyn Poller>,
    running: AtomicBool,
    in_progress: AtomicBool,
    skipped_ticks: AtomicU64,
    known_ids: Mutex<HashSet<String>>,
}

impl LoopInner {
    /// Run one tick unless the previous one is still in flight
    async fn run_once(&self) -> bool {
        if self.in_progress.swap(true, Ordering::SeqCst) {
            self.skipped_ticks.fetch_add(1, Ordering::SeqCst);
            tracing::warn!(
                poller = self.poller.name(),
                "Previous tick still running; skipping this tick"
            );
            return false;
        }

        self.tick().await;
        self.in_progress.store(false, Ordering::SeqCst);
        true
    }

    async fn tick(&self) {
        let snapshot = self.registry.snapshot().await;
        let current: HashSet<String> = snapshot.iter().map(|c| c.id.clone()).collect();

        let removed: Vec<String> = {
            let mut known = self.known_ids.lock().await;
            let gone = known.difference(&current).cloned().collect();
            *known = current;
            gone
        };
        for id in removed {
            tracing::debug!(
                poller = self.poller.name(),
                connection = %id,
                "Connection removed; cleaning up poller state"
            );
            self.poller.on_connection_removed(&id).await;
        }

        let targets: Vec<LiveConnection> = snapshot
            .into_iter()
            .filter(|c| self.poller.include_disconnected() || c.client.is_connected())
            .collect();

        let polls = targets.iter().map(|conn| async move {
            if let Err(e) = self.poller.poll(conn).await {
                tracing::warn!(
                    poller = self.poller.name(),
                    connection = %conn.id,
                    error = %e,
                    "Poll failed"
                );
            }
        });
        futures::future::join_all(polls).await;
    }
}

/// Drives one poller on its own schedule across all registered connections
pub struct PollingLoop {
    inner: Arc<LoopInner>,
    handle: StdMutex<Option<JoinHandle<()>>>,
}

impl PollingLoop {
    pub fn new(registry: Arc<ConnectionRegistry>, poller: Arc<dyn Poller>) -> Self {
        Self {
            inner: Arc::new(LoopInner {
                registry,
                poller,
                running: AtomicBool::new(false),
                in_progress: AtomicBool::new(false),
                skipped_ticks: AtomicU64::new(0),
                known_ids: Mutex::new(HashSet::new()),
            }),
            handle: StdMutex::new(None),
        }
    }

    /// Start the schedule; logged no-op when already running
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            tracing::warn!(poller = self.inner.poller.name(), "Loop already running");
            return;
        }

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(inner.poller.interval()).await;
                if !inner.running.load(Ordering::SeqCst) {
                    break;
                }
                // The tick runs detached so a slow tick is observed (and
                // skipped) by the next timer firing instead of delaying it
                let tick = inner.clone();
                tokio::spawn(async move {
                    tick.run_once().await;
                });
            }
        });

        let mut slot = match self.handle.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(handle);
        tracing::info!(poller = self.inner.poller.name(), "Polling loop started");
    }

    /// Cancel the next tick; an in-flight tick finishes. Idempotent.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let handle = {
            let mut slot = match self.handle.lock() {
                Ok(slot) => slot,
                Err(poisoned) => poisoned.into_inner(),
            };
            slot.take()
        };
        if let Some(handle) = handle {
            handle.abort();
        }
        tracing::info!(poller = self.inner.poller.name(), "Polling loop stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Run a single tick immediately, honoring the overlap guard.
    /// Returns false when the tick was skipped.
    pub async fn run_once(&self) -> bool {
        self.inner.run_once().await
    }

    /// Ticks skipped because the previous one was still running
    pub fn skipped_ticks(&self) -> u64 {
        self.inner.skipped_ticks.load(Ordering::SeqCst)
    }
}

impl Drop for PollingLoop {
    fn drop(&mut self) {
        self.stop();
    }
}
