//! In-memory port implementations for testing and single-process use
//!
//! `MemoryTargetClient` is scriptable: tests preload records, inject
//! per-operation errors, and control connect behavior. `MemoryStore` keeps
//! everything in maps behind a `tokio::sync::RwLock`. `MemoryTransport`
//! replays queued responses and records every request it sees.

use crate::error::{Result, WatchError};
use crate::port::{
    ClientFactory, DeliveryFilter, DeliveryTransport, MonitorStore, RecordQuery, TargetClient,
    TransportResponse,
};
use crate::types::{
    AclLogEntry, ClientRecord, ClientSnapshot, CommandLogEntry, CommandLogKind, ConfigDiff,
    ConnectionCapabilities, ConnectionConfig, DeliveryStatus, Operation, SlowLogEntry,
    WebhookConfig, WebhookDelivery,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

// ─── Target client ───────────────────────────────────────────────

/// Scriptable in-memory target
#[derive(Default)]
pub struct MemoryTargetClient {
    connected: AtomicBool,
    connect_error: RwLock<Option<String>>,
    capabilities: RwLock<ConnectionCapabilities>,
    op_errors: RwLock<HashMap<Operation, String>>,
    acl_entries: RwLock<Vec<AclLogEntry>>,
    slow_entries: RwLock<Vec<SlowLogEntry>>,
    command_entries: RwLock<HashMap<CommandLogKind, Vec<CommandLogEntry>>>,
    client_records: RwLock<Vec<ClientRecord>>,
    config_map: RwLock<HashMap<String, String>>,
    acl_user_list: RwLock<Vec<String>>,
    connect_count: AtomicUsize,
}

impl MemoryTargetClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next connect attempts fail with this error message
    pub fn fail_connect(&self, message: impl Into<String>) {
        *self.connect_error.write().unwrap() = Some(message.into());
    }

    /// Clear any scripted connect failure
    pub fn allow_connect(&self) {
        *self.connect_error.write().unwrap() = None;
    }

    /// Make one operation fail with this error message
    pub fn fail_operation(&self, op: Operation, message: impl Into<String>) {
        self.op_errors.write().unwrap().insert(op, message.into());
    }

    pub fn set_capabilities(&self, caps: ConnectionCapabilities) {
        *self.capabilities.write().unwrap() = caps;
    }

    pub fn set_acl_log(&self, entries: Vec<AclLogEntry>) {
        *self.acl_entries.write().unwrap() = entries;
    }

    pub fn set_acl_users(&self, users: Vec<String>) {
        *self.acl_user_list.write().unwrap() = users;
    }

    pub fn set_slow_log(&self, entries: Vec<SlowLogEntry>) {
        *self.slow_entries.write().unwrap() = entries;
    }

    pub fn set_command_log(&self, kind: CommandLogKind, entries: Vec<CommandLogEntry>) {
        self.command_entries.write().unwrap().insert(kind, entries);
    }

    pub fn set_clients(&self, records: Vec<ClientRecord>) {
        *self.client_records.write().unwrap() = records;
    }

    pub fn set_config_values(&self, values: HashMap<String, String>) {
        *self.config_map.write().unwrap() = values;
    }

    pub fn set_config_value(&self, key: impl Into<String>, value: impl Into<String>) {
        self.config_map.write().unwrap().insert(key.into(), value.into());
    }

    /// Number of successful connect calls observed
    pub fn connect_count(&self) -> usize {
        self.connect_count.load(Ordering::SeqCst)
    }

    fn check_op(&self, op: Operation) -> Result<()> {
        if !self.is_connected() {
            return Err(WatchError::Connection("client is not connected".into()));
        }
        if let Some(message) = self.op_errors.read().unwrap().get(&op) {
            return Err(WatchError::Connection(message.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl TargetClient for MemoryTargetClient {
    async fn connect(&self) -> Result<()> {
        if let Some(message) = self.connect_error.read().unwrap().clone() {
            return Err(WatchError::Connection(message));
        }
        self.connected.store(true, Ordering::SeqCst);
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn capabilities(&self) -> ConnectionCapabilities {
        self.capabilities.read().unwrap().clone()
    }

    async fn acl_log(&self, count: usize) -> Result<Vec<AclLogEntry>> {
        self.check_op(Operation::AclLog)?;
        let entries = self.acl_entries.read().unwrap();
        Ok(entries.iter().take(count).cloned().collect())
    }

    async fn slow_log(&self, count: usize) -> Result<Vec<SlowLogEntry>> {
        self.check_op(Operation::SlowLog)?;
        let entries = self.slow_entries.read().unwrap();
        Ok(entries.iter().take(count).cloned().collect())
    }

    async fn command_log(
        &self,
        count: usize,
        kind: CommandLogKind,
    ) -> Result<Vec<CommandLogEntry>> {
        self.check_op(Operation::CommandLog)?;
        let entries = self.command_entries.read().unwrap();
        Ok(entries
            .get(&kind)
            .map(|v| v.iter().take(count).cloned().collect())
            .unwrap_or_default())
    }

    async fn clients(&self) -> Result<Vec<ClientRecord>> {
        self.check_op(Operation::ClientList)?;
        Ok(self.client_records.read().unwrap().clone())
    }

    async fn config_values(&self, pattern: &str) -> Result<HashMap<String, String>> {
        // Treated as a CONFIG GET; the memory target only supports "*"
        let _ = pattern;
        if !self.is_connected() {
            return Err(WatchError::Connection("client is not connected".into()));
        }
        Ok(self.config_map.read().unwrap().clone())
    }

    async fn acl_users(&self) -> Result<Vec<String>> {
        self.check_op(Operation::AclLog)?;
        Ok(self.acl_user_list.read().unwrap().clone())
    }

    async fn acl_list(&self) -> Result<Vec<String>> {
        self.check_op(Operation::AclLog)?;
        Ok(self.acl_user_list
            .read()
            .unwrap()
            .iter()
            .map(|u| format!("user {} on", u))
            .collect())
    }
}

/// Factory handing out pre-registered clients keyed by `host:port`
///
/// Unregistered targets get a fresh default client, so tests only script
/// the connections they care about.
#[derive(Default)]
pub struct MemoryClientFactory {
    clients: RwLock<HashMap<String, Arc<MemoryTargetClient>>>,
}

impl MemoryClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, host: &str, port: u16, client: Arc<MemoryTargetClient>) {
        self.clients
            .write()
            .unwrap()
            .insert(format!("{}:{}", host, port), client);
    }
}

impl ClientFactory for MemoryClientFactory {
    fn build(&self, config: &ConnectionConfig) -> Arc<dyn TargetClient> {
        let key = format!("{}:{}", config.host, config.port);
        let clients = self.clients.read().unwrap();
        match clients.get(&key) {
            Some(client) => client.clone(),
            None => Arc::new(MemoryTargetClient::new()),
        }
    }
}

// ─── Store ───────────────────────────────────────────────────────

#[derive(Default)]
struct StoreInner {
    connections: HashMap<String, ConnectionConfig>,
    acl: HashMap<String, Vec<AclLogEntry>>,
    slowlog: HashMap<String, Vec<SlowLogEntry>>,
    commandlog: HashMap<String, Vec<CommandLogEntry>>,
    snapshots: HashMap<String, Vec<ClientSnapshot>>,
    config_diffs: Vec<ConfigDiff>,
    webhooks: HashMap<String, WebhookConfig>,
    deliveries: HashMap<String, WebhookDelivery>,
}

/// In-memory persistence for tests and single-process use
#[derive(Default)]
pub struct MemoryStore {
    inner: tokio::sync::RwLock<StoreInner>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail, for persistence-error paths
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_write(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(WatchError::Persistence("write failure injected".into()));
        }
        Ok(())
    }
}

fn apply_limit<T>(items: Vec<T>, query: &RecordQuery) -> Vec<T> {
    items
        .into_iter()
        .skip(query.offset)
        .take(query.limit.unwrap_or(usize::MAX))
        .collect()
}

/// Time-range filter over records carrying unix-millisecond timestamps
fn apply_range_millis<T>(items: Vec<T>, query: &RecordQuery, millis: impl Fn(&T) -> i64) -> Vec<T> {
    items
        .into_iter()
        .filter(|item| {
            query.since.map_or(true, |s| millis(item) >= s.timestamp_millis())
                && query.until.map_or(true, |u| millis(item) <= u.timestamp_millis())
        })
        .collect()
}

/// Time-range filter over records carrying `DateTime<Utc>` timestamps
fn apply_range<T>(items: Vec<T>, query: &RecordQuery, at: impl Fn(&T) -> DateTime<Utc>) -> Vec<T> {
    items
        .into_iter()
        .filter(|item| {
            query.since.map_or(true, |s| at(item) >= s)
                && query.until.map_or(true, |u| at(item) <= u)
        })
        .collect()
}

#[async_trait]
impl MonitorStore for MemoryStore {
    async fn connections(&self) -> Result<Vec<ConnectionConfig>> {
        let inner = self.inner.read().await;
        let mut configs: Vec<_> = inner.connections.values().cloned().collect();
        configs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(configs)
    }

    async fn save_connection(&self, config: &ConnectionConfig) -> Result<()> {
        self.check_write()?;
        let mut inner = self.inner.write().await;
        inner.connections.insert(config.id.clone(), config.clone());
        Ok(())
    }

    async fn update_connection(&self, config: &ConnectionConfig) -> Result<()> {
        self.check_write()?;
        let mut inner = self.inner.write().await;
        if !inner.connections.contains_key(&config.id) {
            return Err(WatchError::NotFound(format!(
                "connection '{}' not found in store",
                config.id
            )));
        }
        inner.connections.insert(config.id.clone(), config.clone());
        Ok(())
    }

    async fn delete_connection(&self, id: &str) -> Result<()> {
        self.check_write()?;
        let mut inner = self.inner.write().await;
        inner.connections.remove(id);
        inner.acl.remove(id);
        inner.slowlog.remove(id);
        inner.commandlog.remove(id);
        inner.snapshots.remove(id);
        Ok(())
    }

    async fn save_acl_entries(&self, connection_id: &str, entries: &[AclLogEntry]) -> Result<()> {
        self.check_write()?;
        let mut inner = self.inner.write().await;
        inner
            .acl
            .entry(connection_id.to_string())
            .or_default()
            .extend_from_slice(entries);
        Ok(())
    }

    async fn acl_entries(
        &self,
        connection_id: &str,
        query: &RecordQuery,
    ) -> Result<Vec<AclLogEntry>> {
        let inner = self.inner.read().await;
        let items = inner.acl.get(connection_id).cloned().unwrap_or_default();
        let items = apply_range_millis(items, query, |e| e.timestamp as i64);
        Ok(apply_limit(items, query))
    }

    async fn save_slowlog_entries(
        &self,
        connection_id: &str,
        entries: &[SlowLogEntry],
    ) -> Result<()> {
        self.check_write()?;
        let mut inner = self.inner.write().await;
        inner
            .slowlog
            .entry(connection_id.to_string())
            .or_default()
            .extend_from_slice(entries);
        Ok(())
    }

    async fn slowlog_entries(
        &self,
        connection_id: &str,
        query: &RecordQuery,
    ) -> Result<Vec<SlowLogEntry>> {
        let inner = self.inner.read().await;
        let items = inner.slowlog.get(connection_id).cloned().unwrap_or_default();
        let items = apply_range_millis(items, query, |e| e.timestamp as i64 * 1_000);
        Ok(apply_limit(items, query))
    }

    async fn save_commandlog_entries(
        &self,
        connection_id: &str,
        entries: &[CommandLogEntry],
    ) -> Result<()> {
        self.check_write()?;
        let mut inner = self.inner.write().await;
        inner
            .commandlog
            .entry(connection_id.to_string())
            .or_default()
            .extend_from_slice(entries);
        Ok(())
    }

    async fn commandlog_entries(
        &self,
        connection_id: &str,
        query: &RecordQuery,
    ) -> Result<Vec<CommandLogEntry>> {
        let inner = self.inner.read().await;
        let items = inner
            .commandlog
            .get(connection_id)
            .cloned()
            .unwrap_or_default();
        let items = apply_range_millis(items, query, |e| e.timestamp as i64 * 1_000);
        Ok(apply_limit(items, query))
    }

    async fn save_client_snapshot(&self, snapshot: &ClientSnapshot) -> Result<()> {
        self.check_write()?;
        let mut inner = self.inner.write().await;
        inner
            .snapshots
            .entry(snapshot.connection_id.clone())
            .or_default()
            .push(snapshot.clone());
        Ok(())
    }

    async fn client_snapshots(
        &self,
        connection_id: &str,
        query: &RecordQuery,
    ) -> Result<Vec<ClientSnapshot>> {
        let inner = self.inner.read().await;
        let items = inner
            .snapshots
            .get(connection_id)
            .cloned()
            .unwrap_or_default();
        let items = apply_range(items, query, |s| s.taken_at);
        Ok(apply_limit(items, query))
    }

    async fn save_config_diffs(&self, diffs: &[ConfigDiff]) -> Result<()> {
        self.check_write()?;
        let mut inner = self.inner.write().await;
        inner.config_diffs.extend_from_slice(diffs);
        Ok(())
    }

    async fn config_diffs(
        &self,
        connection_id: &str,
        query: &RecordQuery,
    ) -> Result<Vec<ConfigDiff>> {
        let inner = self.inner.read().await;
        let items: Vec<_> = inner
            .config_diffs
            .iter()
            .filter(|d| d.connection_id == connection_id)
            .cloned()
            .collect();
        let items = apply_range(items, query, |d| d.detected_at);
        Ok(apply_limit(items, query))
    }

    async fn prune_records(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.check_write()?;
        let cutoff_millis = cutoff.timestamp_millis();
        let mut inner = self.inner.write().await;
        let mut removed = 0;
        for entries in inner.acl.values_mut() {
            let before = entries.len();
            entries.retain(|e| e.timestamp as i64 >= cutoff_millis);
            removed += before - entries.len();
        }
        for entries in inner.slowlog.values_mut() {
            let before = entries.len();
            entries.retain(|e| e.timestamp as i64 * 1_000 >= cutoff_millis);
            removed += before - entries.len();
        }
        for entries in inner.commandlog.values_mut() {
            let before = entries.len();
            entries.retain(|e| e.timestamp as i64 * 1_000 >= cutoff_millis);
            removed += before - entries.len();
        }
        for snapshots in inner.snapshots.values_mut() {
            let before = snapshots.len();
            snapshots.retain(|s| s.taken_at >= cutoff);
            removed += before - snapshots.len();
        }
        let before = inner.config_diffs.len();
        inner.config_diffs.retain(|d| d.detected_at >= cutoff);
        removed += before - inner.config_diffs.len();
        Ok(removed)
    }

    async fn webhooks(&self) -> Result<Vec<WebhookConfig>> {
        let inner = self.inner.read().await;
        let mut hooks: Vec<_> = inner.webhooks.values().cloned().collect();
        hooks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(hooks)
    }

    async fn webhook(&self, id: &str) -> Result<Option<WebhookConfig>> {
        let inner = self.inner.read().await;
        Ok(inner.webhooks.get(id).cloned())
    }

    async fn save_webhook(&self, webhook: &WebhookConfig) -> Result<()> {
        self.check_write()?;
        let mut inner = self.inner.write().await;
        inner.webhooks.insert(webhook.id.clone(), webhook.clone());
        Ok(())
    }

    async fn delete_webhook(&self, id: &str) -> Result<()> {
        self.check_write()?;
        let mut inner = self.inner.write().await;
        inner.webhooks.remove(id);
        Ok(())
    }

    async fn save_delivery(&self, delivery: &WebhookDelivery) -> Result<()> {
        self.check_write()?;
        let mut inner = self.inner.write().await;
        inner.deliveries.insert(delivery.id.clone(), delivery.clone());
        Ok(())
    }

    async fn update_delivery(&self, delivery: &WebhookDelivery) -> Result<()> {
        self.check_write()?;
        let mut inner = self.inner.write().await;
        inner.deliveries.insert(delivery.id.clone(), delivery.clone());
        Ok(())
    }

    async fn delivery(&self, id: &str) -> Result<Option<WebhookDelivery>> {
        let inner = self.inner.read().await;
        Ok(inner.deliveries.get(id).cloned())
    }

    async fn deliveries(&self, filter: &DeliveryFilter) -> Result<Vec<WebhookDelivery>> {
        let inner = self.inner.read().await;
        let mut items: Vec<_> = inner
            .deliveries
            .values()
            .filter(|d| {
                filter
                    .webhook_id
                    .as_ref()
                    .map_or(true, |w| &d.webhook_id == w)
                    && filter.status.map_or(true, |s| d.status == s)
            })
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        items.truncate(filter.limit.unwrap_or(usize::MAX));
        Ok(items)
    }

    async fn due_retries(&self, now: DateTime<Utc>) -> Result<Vec<WebhookDelivery>> {
        let inner = self.inner.read().await;
        Ok(inner
            .deliveries
            .values()
            .filter(|d| {
                d.status == DeliveryStatus::Retrying
                    && d.next_retry_at.map_or(false, |t| t <= now)
            })
            .cloned()
            .collect())
    }

    async fn prune_deliveries(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.check_write()?;
        let mut inner = self.inner.write().await;
        let before = inner.deliveries.len();
        inner.deliveries.retain(|_, d| d.created_at >= cutoff);
        Ok(before - inner.deliveries.len())
    }
}

// ─── Transport ───────────────────────────────────────────────────

/// A request recorded by the memory transport
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub url: String,
    pub body: String,
    pub headers: HashMap<String, String>,
    pub timeout: Duration,
}

/// Replays queued responses; defaults to 200 when the queue is empty
#[derive(Default)]
pub struct MemoryTransport {
    responses: Mutex<VecDeque<Result<TransportResponse>>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_response(&self, status: u16, body: impl Into<String>) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Ok(TransportResponse {
                status,
                body: body.into(),
            }));
    }

    pub fn queue_error(&self, message: impl Into<String>) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Err(WatchError::Transport(message.into())));
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl DeliveryTransport for MemoryTransport {
    async fn post(
        &self,
        url: &str,
        body: &str,
        headers: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<TransportResponse> {
        self.requests.lock().unwrap().push(RecordedRequest {
            url: url.to_string(),
            body: body.to_string(),
            headers: headers.clone(),
            timeout,
        });
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(TransportResponse {
                status: 200,
                body: String::new(),
            }))
    }
}
