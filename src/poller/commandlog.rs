//! COMMANDLOG poller (Valkey 8.1+)
//!
//! Polls all three COMMANDLOG kinds. Gated twice: the capability
//! descriptor captured at connect must advertise the feature, and the
//! runtime tracker must not have recorded a rejection since.

use crate::capability::CapabilityTracker;
use crate::config::WatchConfig;
use crate::error::Result;
use crate::poller::{ConnState, Poller};
use crate::port::MonitorStore;
use crate::registry::LiveConnection;
use crate::types::{CommandLogEntry, CommandLogKind, Operation};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const FETCH_COUNT: usize = 128;

const KINDS: [CommandLogKind; 3] = [
    CommandLogKind::Slow,
    CommandLogKind::LargeRequest,
    CommandLogKind::LargeReply,
];

pub struct CommandLogPoller {
    store: Arc<dyn MonitorStore>,
    tracker: Arc<CapabilityTracker>,
    config: Arc<WatchConfig>,
    // Entry ids are monotonic per kind, so one cursor per (connection, kind)
    cursors: ConnState<HashMap<CommandLogKind, u64>>,
}

impl CommandLogPoller {
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
impl Poller for CommandLogPoller {
    fn name(&self) -> &'static str {
        "commandlog"
    }

    fn interval(&self) -> Duration {
        self.config.commandlog_interval.get()
    }

    async fn poll(&self, conn: &LiveConnection) -> Result<()> {
        if !conn.capabilities.has_command_log {
            tracing::debug!(connection = %conn.id, "Target does not advertise COMMANDLOG");
            return Ok(());
        }
        if !self.tracker.is_available(&conn.id, Operation::CommandLog) {
            tracing::debug!(connection = %conn.id, "COMMANDLOG unavailable; skipping");
            return Ok(());
        }

        let mut cursors = self.cursors.get(&conn.id).unwrap_or_default();

        for kind in KINDS {
            let entries = match conn.client.command_log(FETCH_COUNT, kind).await {
                Ok(entries) => entries,
                Err(e) => {
                    // A rejection of one kind disables the whole operation
                    if self
                        .tracker
                        .record_failure(&conn.id, Operation::CommandLog, &e)
                    {
                        return Ok(());
                    }
                    return Err(e);
                }
            };

            let cursor = cursors.get(&kind).copied();
            let new_entries: Vec<CommandLogEntry> = entries
                .into_iter()
                .filter(|e| cursor.map_or(true, |max_id| e.id > max_id))
                .collect();
            if new_entries.is_empty() {
                continue;
            }

            self.store
                .save_commandlog_entries(&conn.id, &new_entries)
                .await?;

            if let Some(max_id) = new_entries.iter().map(|e| e.id).max() {
                cursors.insert(kind, max_id);
                self.cursors.set(&conn.id, cursors.clone());
            }

            tracing::debug!(
                connection = %conn.id,
                kind = %kind,
                entries = new_entries.len(),
                "New commandlog entries captured"
            );
        }

        Ok(())
    }

    async fn on_connection_removed(&self, connection_id: &str) {
        self.cursors.remove(connection_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::memory::{MemoryStore, MemoryTargetClient};
    use crate::port::{RecordQuery, TargetClient};
    use crate::types::{ConnectionCapabilities, EngineFlavor};

    fn entry(id: u64, kind: CommandLogKind) -> CommandLogEntry {
        CommandLogEntry {
            id,
            kind,
            timestamp: 1_700_000_000 + id,
            value: 4096,
            command: vec!["SET".into(), "k".into()],
            client_addr: "10.0.0.9:40000".into(),
            client_name: String::new(),
        }
    }

    fn valkey_caps() -> ConnectionCapabilities {
        ConnectionCapabilities {
            flavor: EngineFlavor::Valkey,
            version: "8.1.0".into(),
            has_command_log: true,
            ..Default::default()
        }
    }

    async fn live(id: &str, client: Arc<MemoryTargetClient>) -> LiveConnection {
        client.connect().await.unwrap();
        LiveConnection {
            id: id.into(),
            capabilities: client.capabilities(),
            client,
        }
    }

    fn poller(store: Arc<MemoryStore>, tracker: Arc<CapabilityTracker>) -> CommandLogPoller {
        CommandLogPoller::new(store, tracker, Arc::new(WatchConfig::default()))
    }

    #[tokio::test]
    async fn test_skips_targets_without_the_feature() {
        let store = Arc::new(MemoryStore::new());
        let client = Arc::new(MemoryTargetClient::new());
        client.set_command_log(CommandLogKind::Slow, vec![entry(1, CommandLogKind::Slow)]);
        // Default capabilities: has_command_log = false
        let conn = live("conn-old", client).await;
        let p = poller(store.clone(), Arc::new(CapabilityTracker::new()));

        p.poll(&conn).await.unwrap();
        assert!(store
            .commandlog_entries("conn-old", &RecordQuery::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_per_kind_cursors() {
        let store = Arc::new(MemoryStore::new());
        let client = Arc::new(MemoryTargetClient::new());
        client.set_capabilities(valkey_caps());
        client.set_command_log(CommandLogKind::Slow, vec![entry(5, CommandLogKind::Slow)]);
        client.set_command_log(
            CommandLogKind::LargeReply,
            vec![entry(2, CommandLogKind::LargeReply)],
        );
        let conn = live("conn-vk", client.clone()).await;
        let p = poller(store.clone(), Arc::new(CapabilityTracker::new()));

        p.poll(&conn).await.unwrap();
        assert_eq!(
            store
                .commandlog_entries("conn-vk", &RecordQuery::default())
                .await
                .unwrap()
                .len(),
            2
        );

        // Slow id 5 already seen; large-reply advances to 3
        client.set_command_log(
            CommandLogKind::LargeReply,
            vec![entry(3, CommandLogKind::LargeReply), entry(2, CommandLogKind::LargeReply)],
        );
        p.poll(&conn).await.unwrap();
        assert_eq!(
            store
                .commandlog_entries("conn-vk", &RecordQuery::default())
                .await
                .unwrap()
                .len(),
            3
        );
    }

    #[tokio::test]
    async fn test_two_connections_one_degrades() {
        let store = Arc::new(MemoryStore::new());
        let tracker = Arc::new(CapabilityTracker::new());
        let p = poller(store.clone(), tracker.clone());

        let a = Arc::new(MemoryTargetClient::new());
        a.set_capabilities(valkey_caps());
        a.set_command_log(CommandLogKind::Slow, vec![entry(1, CommandLogKind::Slow)]);
        let conn_a = live("conn-a", a.clone()).await;

        // B advertises the feature but an ACL denies it at runtime
        let b = Arc::new(MemoryTargetClient::new());
        b.set_capabilities(valkey_caps());
        b.fail_operation(
            Operation::CommandLog,
            "NOPERM this user has no permissions to run the 'commandlog' command",
        );
        let conn_b = live("conn-b", b).await;

        p.poll(&conn_a).await.unwrap();
        p.poll(&conn_b).await.unwrap();

        assert_eq!(
            store
                .commandlog_entries("conn-a", &RecordQuery::default())
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(!tracker.is_available("conn-b", Operation::CommandLog));

        // Second tick: A captures its new entry, B is skipped entirely
        a.set_command_log(
            CommandLogKind::Slow,
            vec![entry(2, CommandLogKind::Slow), entry(1, CommandLogKind::Slow)],
        );
        p.poll(&conn_a).await.unwrap();
        p.poll(&conn_b).await.unwrap();

        assert_eq!(
            store
                .commandlog_entries("conn-a", &RecordQuery::default())
                .await
                .unwrap()
                .len(),
            2
        );
        assert!(store
            .commandlog_entries("conn-b", &RecordQuery::default())
            .await
            .unwrap()
            .is_empty());
    }
}
