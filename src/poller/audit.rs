//! ACL-log poller
//!
//! Captures authentication and permission denials from ACL LOG, persists
//! the new ones, and dispatches `acl.denied` webhook events.

use crate::capability::CapabilityTracker;
use crate::config::WatchConfig;
use crate::delivery::WebhookEngine;
use crate::error::Result;
use crate::poller::{ConnState, Poller};
use crate::port::MonitorStore;
use crate::registry::LiveConnection;
use crate::types::{AclLogEntry, Operation};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

const FETCH_COUNT: usize = 128;

pub const EVENT_ACL_DENIED: &str = "acl.denied";

/// Last-seen position in a connection's ACL log.
///
/// The target reuses one entry for repeated denials of the same
/// (user, context) pair and bumps its count, so the cursor tracks both.
#[derive(Debug, Clone, Copy, Default)]
struct AuditCursor {
    timestamp: u64,
    count: u64,
}

pub struct AuditPoller {
    store: Arc<dyn MonitorStore>,
    tracker: Arc<CapabilityTracker>,
    config: Arc<WatchConfig>,
    engine: Option<Arc<WebhookEngine>>,
    cursors: ConnState<AuditCursor>,
}

impl AuditPoller {
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
            cursors: ConnState::new(),
        }
    }

    fn is_new(cursor: AuditCursor, entry: &AclLogEntry) -> bool {
        entry.timestamp > cursor.timestamp
            || (entry.timestamp == cursor.timestamp && entry.count > cursor.count)
    }
}

#[async_trait]
impl Poller for AuditPoller {
    fn name(&self) -> &'static str {
        "audit"
    }

    fn interval(&self) -> Duration {
        self.config.audit_interval.get()
    }

    async fn poll(&self, conn: &LiveConnection) -> Result<()> {
        if !self.tracker.is_available(&conn.id, Operation::AclLog) {
            tracing::debug!(connection = %conn.id, "ACL LOG unavailable; skipping");
            return Ok(());
        }

        let entries = match conn.client.acl_log(FETCH_COUNT).await {
            Ok(entries) => entries,
            Err(e) => {
                if self.tracker.record_failure(&conn.id, Operation::AclLog, &e) {
                    return Ok(());
                }
                return Err(e);
            }
        };

        let cursor = self.cursors.get(&conn.id).unwrap_or_default();
        let new_entries: Vec<AclLogEntry> = entries
            .into_iter()
            .filter(|e| Self::is_new(cursor, e))
            .collect();
        if new_entries.is_empty() {
            return Ok(());
        }

        self.store.save_acl_entries(&conn.id, &new_entries).await?;

        // Cursor moves only after the save succeeded
        let mut advanced = cursor;
        for entry in &new_entries {
            if entry.timestamp > advanced.timestamp
                || (entry.timestamp == advanced.timestamp && entry.count > advanced.count)
            {
                advanced = AuditCursor {
                    timestamp: entry.timestamp,
                    count: entry.count,
                };
            }
        }
        self.cursors.set(&conn.id, advanced);

        tracing::info!(
            connection = %conn.id,
            denials = new_entries.len(),
            "New ACL denials captured"
        );

        if let Some(engine) = &self.engine {
            for entry in &new_entries {
                let payload = serde_json::json!({
                    "username": entry.username,
                    "reason": entry.reason,
                    "context": entry.context,
                    "object": entry.object,
                    "count": entry.count,
                    "clientInfo": entry.client_info,
                    "timestamp": entry.timestamp,
                });
                engine
                    .dispatch(EVENT_ACL_DENIED, payload, Some(&conn.id))
                    .await;
            }
        }

        Ok(())
    }

    async fn on_connection_removed(&self, connection_id: &str) {
        self.cursors.remove(connection_id);
    }
}
