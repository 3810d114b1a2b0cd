//! Client-analytics poller
//!
//! Persists one CLIENT LIST snapshot per tick per connection. There is no
//! cursor: the snapshot history itself is the record.

use crate::capability::CapabilityTracker;
use crate::config::WatchConfig;
use crate::error::Result;
use crate::poller::Poller;
use crate::port::MonitorStore;
use crate::registry::LiveConnection;
use crate::types::{ClientSnapshot, Operation};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

pub struct ClientsPoller {
    store: Arc<dyn MonitorStore>,
    tracker: Arc<CapabilityTracker>,
    config: Arc<WatchConfig>,
}

impl ClientsPoller {
    pub fn new(
        store: Arc<dyn MonitorStore>,
        tracker: Arc<CapabilityTracker>,
        config: Arc<WatchConfig>,
    ) -> Self {
        Self {
            store,
            tracker,
            config,
        }
    }
}

#[async_trait]
impl Poller for ClientsPoller {
    fn name(&self) -> &'static str {
        "clients"
    }

    fn interval(&self) -> Duration {
        self.config.clients_interval.get()
    }

    async fn poll(&self, conn: &LiveConnection) -> Result<()> {
        if !self.tracker.is_available(&conn.id, Operation::ClientList) {
            tracing::debug!(connection = %conn.id, "CLIENT LIST unavailable; skipping");
            return Ok(());
        }

        let clients = match conn.client.clients().await {
            Ok(clients) => clients,
            Err(e) => {
                if self
                    .tracker
                    .record_failure(&conn.id, Operation::ClientList, &e)
                {
                    return Ok(());
                }
                return Err(e);
            }
        };

        let snapshot = ClientSnapshot {
            connection_id: conn.id.clone(),
            taken_at: Utc::now(),
            total_clients: clients.len(),
            clients,
        };
        self.store.save_client_snapshot(&snapshot).await?;

        tracing::debug!(
            connection = %conn.id,
            clients = snapshot.total_clients,
            "Client snapshot captured"
        );
        Ok(())
    }

    async fn on_connection_removed(&self, _connection_id: &str) {}
}
