//! Slowlog poller
//!
//! Captures new SLOWLOG entries per connection. Entry ids are assigned
//! monotonically by the target, so the cursor is the highest id seen.

use crate::capability::CapabilityTracker;
use crate::config::WatchConfig;
use crate::error::Result;
use crate::poller::{ConnState, Poller};
use crate::port::MonitorStore;
use crate::registry::LiveConnection;
use crate::types::{Operation, SlowLogEntry};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

const FETCH_COUNT: usize = 128;

pub struct SlowLogPoller {
    store: Arc<dyn MonitorStore>,
    tracker: Arc<CapabilityTracker>,
    config: Arc<WatchConfig>,
    cursors: ConnState<u64>,
}

impl SlowLogPoller {
    pub fn new(
        store: Arc<dyn MonitorStore>,
        tracker: Arc<CapabilityTracker>,
        config: Arc<WatchConfig>,
    ) -> Self {
        Self {
            store,
            tracker,
            config,
            cursors: ConnState::new(),
        }
    }
}

#[async_trait]
impl Poller for SlowLogPoller {
    fn name(&self) -> &'static str {
        "slowlog"
    }

    fn interval(&self) -> Duration {
        self.config.slowlog_interval.get()
    }

    async fn poll(&self, conn: &LiveConnection) -> Result<()> {
        if !self.tracker.is_available(&conn.id, Operation::SlowLog) {
            tracing::debug!(connection = %conn.id, "SLOWLOG unavailable; skipping");
            return Ok(());
        }

        let entries = match conn.client.slow_log(FETCH_COUNT).await {
            Ok(entries) => entries,
            Err(e) => {
                if self.tracker.record_failure(&conn.id, Operation::SlowLog, &e) {
                    return Ok(());
                }
                return Err(e);
            }
        };

        let cursor = self.cursors.get(&conn.id);
        let new_entries: Vec<SlowLogEntry> = entries
            .into_iter()
            .filter(|e| cursor.map_or(true, |max_id| e.id > max_id))
            .collect();
        if new_entries.is_empty() {
            return Ok(());
        }

        self.store
            .save_slowlog_entries(&conn.id, &new_entries)
            .await?;

        if let Some(max_id) = new_entries.iter().map(|e| e.id).max() {
            self.cursors.set(&conn.id, max_id);
        }

        tracing::debug!(
            connection = %conn.id,
            entries = new_entries.len(),
            "New slowlog entries captured"
        );
        Ok(())
    }

    async fn on_connection_removed(&self, connection_id: &str) {
        self.cursors.remove(connection_id);
    }
}
