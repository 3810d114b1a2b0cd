//! Configuration drift monitor
//!
//! Diffs CONFIG GET output against the last-seen values per connection.
//! The first observation establishes a baseline without emitting drift
//! rows; later ticks persist a `ConfigDiff` per changed or newly-appeared
//! parameter and dispatch `config.drift` webhook events.

use crate::capability::CapabilityTracker;
use crate::config::WatchConfig;
use crate::delivery::WebhookEngine;
use crate::error::Result;
use crate::poller::{ConnState, Poller};
use crate::port::MonitorStore;
use crate::registry::LiveConnection;
use crate::types::{ConfigDiff, Operation};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const CONFIG_PATTERN: &str = "*";

pub const EVENT_CONFIG_DRIFT: &str = "config.drift";

pub struct ConfigMonitorPoller {
    store: Arc<dyn MonitorStore>,
    tracker: Arc<CapabilityTracker>,
    config: Arc<WatchConfig>,
    engine: Option<Arc<WebhookEngine>>,
    baselines: ConnState<HashMap<String, String>>,
}

impl ConfigMonitorPoller {
    pub fn new(
        store: Arc<dyn MonitorStore>,
        tracker: Arc<CapabilityTracker>,
        config: Arc<WatchConfig>,
        engine: Option<Arc<WebhookEngine>>,
    ) -> Self {
        Self {
            store,
            tracker,
            config,
            engine,
            baselines: ConnState::new(),
        }
    }
}

#[async_trait]
impl Poller for ConfigMonitorPoller {
    fn name(&self) -> &'static str {
        "config-monitor"
    }

    fn interval(&self) -> Duration {
        self.config.config_monitor_interval.get()
    }

    async fn poll(&self, conn: &LiveConnection) -> Result<()> {
        if !self.tracker.is_available(&conn.id, Operation::ConfigGet) {
            tracing::debug!(connection = %conn.id, "CONFIG GET unavailable; skipping");
            return Ok(());
        }

        let current = match conn.client.config_values(CONFIG_PATTERN).await {
            Ok(values) => values,
            Err(e) => {
                if self
                    .tracker
                    .record_failure(&conn.id, Operation::ConfigGet, &e)
                {
                    return Ok(());
                }
                return Err(e);
            }
        };

        let baseline = match self.baselines.get(&conn.id) {
            Some(baseline) => baseline,
            None => {
                tracing::debug!(
                    connection = %conn.id,
                    parameters = current.len(),
                    "Configuration baseline established"
                );
                self.baselines.set(&conn.id, current);
                return Ok(());
            }
        };

        let now = Utc::now();
        let mut diffs: Vec<ConfigDiff> = current
            .iter()
            .filter(|(key, value)| baseline.get(*key) != Some(*value))
            .map(|(key, value)| ConfigDiff {
                connection_id: conn.id.clone(),
                parameter: key.clone(),
                old_value: baseline.get(key).cloned(),
                new_value: value.clone(),
                detected_at: now,
            })
            .collect();
        if diffs.is_empty() {
            return Ok(());
        }
        diffs.sort_by(|a, b| a.parameter.cmp(&b.parameter));

        self.store.save_config_diffs(&diffs).await?;
        // Baseline only advances once the drift rows are durable
        self.baselines.set(&conn.id, current);

        tracing::info!(
            connection = %conn.id,
            changes = diffs.len(),
            "Configuration drift detected"
        );

        if let Some(engine) = &self.engine {
            for diff in &diffs {
                let payload = serde_json::json!({
                    "parameter": diff.parameter,
                    "oldValue": diff.old_value,
                    "newValue": diff.new_value,
                });
                engine
                    .dispatch(EVENT_CONFIG_DRIFT, payload, Some(&conn.id))
                    .await;
            }
        }

        Ok(())
    }

    async fn on_connection_removed(&self, connection_id: &str) {
        self.baselines.remove(connection_id);
    }
}
