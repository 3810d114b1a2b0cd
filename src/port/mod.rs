//! External ports — the seams to the database client, the persistence
//! layer, and the HTTP delivery transport
//!
//! The core never talks to a wire protocol or a database driver directly;
//! it consumes these traits. Production wiring supplies real adapters, the
//! in-memory implementations in [`memory`] back the test suite and
//! single-process use.

use crate::error::Result;
use crate::types::{
    AclLogEntry, ClientRecord, ClientSnapshot, CommandLogEntry, CommandLogKind, ConfigDiff,
    ConnectionCapabilities, ConnectionConfig, SlowLogEntry, WebhookConfig, WebhookDelivery,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

pub mod memory;

/// Client handle for one target database instance
///
/// Implementations own the wire protocol; the core only sees typed records.
/// A client is built disconnected and moves between connected and
/// disconnected states over its lifetime.
#[async_trait]
pub trait TargetClient: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Capability probe result captured during connect
    fn capabilities(&self) -> ConnectionCapabilities;

    /// ACL LOG — recent authentication/permission denials, newest first
    async fn acl_log(&self, count: usize) -> Result<Vec<AclLogEntry>>;

    /// SLOWLOG GET — recent slow commands, newest first
    async fn slow_log(&self, count: usize) -> Result<Vec<SlowLogEntry>>;

    /// COMMANDLOG GET — Valkey 8.1+ only
    async fn command_log(&self, count: usize, kind: CommandLogKind)
        -> Result<Vec<CommandLogEntry>>;

    /// CLIENT LIST
    async fn clients(&self) -> Result<Vec<ClientRecord>>;

    /// CONFIG GET <pattern>
    async fn config_values(&self, pattern: &str) -> Result<HashMap<String, String>>;

    /// ACL USERS
    async fn acl_users(&self) -> Result<Vec<String>>;

    /// ACL LIST
    async fn acl_list(&self) -> Result<Vec<String>>;
}

/// Builds a fresh disconnected adapter for a connection config
///
/// The registry builds a new adapter for every trial connect, reconnect,
/// and pre-flight test so a failed attempt never disturbs a live handle.
pub trait ClientFactory: Send + Sync {
    fn build(&self, config: &ConnectionConfig) -> Arc<dyn TargetClient>;
}

/// Time-range/pagination options for record queries
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: usize,
}

/// Filter for delivery listings
#[derive(Debug, Clone, Default)]
pub struct DeliveryFilter {
    pub webhook_id: Option<String>,
    pub status: Option<crate::types::DeliveryStatus>,
    pub limit: Option<usize>,
}

/// Persistence port — opaque CRUD plus time-range queries per record type
#[async_trait]
pub trait MonitorStore: Send + Sync {
    // Connection configs
    async fn connections(&self) -> Result<Vec<ConnectionConfig>>;
    async fn save_connection(&self, config: &ConnectionConfig) -> Result<()>;
    async fn update_connection(&self, config: &ConnectionConfig) -> Result<()>;
    async fn delete_connection(&self, id: &str) -> Result<()>;

    // Captured records
    async fn save_acl_entries(&self, connection_id: &str, entries: &[AclLogEntry]) -> Result<()>;
    async fn acl_entries(&self, connection_id: &str, query: &RecordQuery)
        -> Result<Vec<AclLogEntry>>;

    async fn save_slowlog_entries(
        &self,
        connection_id: &str,
        entries: &[SlowLogEntry],
    ) -> Result<()>;
    async fn slowlog_entries(
        &self,
        connection_id: &str,
        query: &RecordQuery,
    ) -> Result<Vec<SlowLogEntry>>;

    async fn save_commandlog_entries(
        &self,
        connection_id: &str,
        entries: &[CommandLogEntry],
    ) -> Result<()>;
    async fn commandlog_entries(
        &self,
        connection_id: &str,
        query: &RecordQuery,
    ) -> Result<Vec<CommandLogEntry>>;

    async fn save_client_snapshot(&self, snapshot: &ClientSnapshot) -> Result<()>;
    async fn client_snapshots(
        &self,
        connection_id: &str,
        query: &RecordQuery,
    ) -> Result<Vec<ClientSnapshot>>;

    async fn save_config_diffs(&self, diffs: &[ConfigDiff]) -> Result<()>;
    async fn config_diffs(&self, connection_id: &str, query: &RecordQuery)
        -> Result<Vec<ConfigDiff>>;

    /// Age-based retention for captured records
    async fn prune_records(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    // Webhook configs
    async fn webhooks(&self) -> Result<Vec<WebhookConfig>>;
    async fn webhook(&self, id: &str) -> Result<Option<WebhookConfig>>;
    async fn save_webhook(&self, webhook: &WebhookConfig) -> Result<()>;
    async fn delete_webhook(&self, id: &str) -> Result<()>;

    // Deliveries
    async fn save_delivery(&self, delivery: &WebhookDelivery) -> Result<()>;
    async fn update_delivery(&self, delivery: &WebhookDelivery) -> Result<()>;
    async fn delivery(&self, id: &str) -> Result<Option<WebhookDelivery>>;
    async fn deliveries(&self, filter: &DeliveryFilter) -> Result<Vec<WebhookDelivery>>;

    /// Deliveries in `retrying` state whose `next_retry_at` has passed
    async fn due_retries(&self, now: DateTime<Utc>) -> Result<Vec<WebhookDelivery>>;

    /// Age-based retention for deliveries
    async fn prune_deliveries(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// Response captured from a webhook endpoint
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Outbound HTTP port consumed by the delivery engine
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    /// POST a JSON body with the given headers, bounded by `timeout`
    async fn post(
        &self,
        url: &str,
        body: &str,
        headers: &HashMap<String, String>,
        timeout: std::time::Duration,
    ) -> Result<TransportResponse>;
}
