//! Core data model for valkey-watch
//!
//! All persisted types use camelCase JSON serialization for wire
//! compatibility with the management surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Id of the distinguished connection derived from process configuration.
///
/// It can never be deleted, only reconnected.
pub const ENV_DEFAULT_ID: &str = "env-default";

/// Default cap on stored webhook response bodies (bytes)
pub const DEFAULT_RESPONSE_BODY_CAP: usize = 10 * 1024;

/// State of a connection's stored credentials
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    /// Never validated against the target
    Unknown,
    /// Last connect succeeded with these credentials
    Valid,
    /// Target rejected the credentials
    Invalid,
    /// Stored ciphertext could not be decrypted with the current master key
    DecryptionFailed,
}

impl Default for CredentialStatus {
    fn default() -> Self {
        CredentialStatus::Unknown
    }
}

/// A configured target database instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// Unique identifier (conn-<uuid>, or `env-default`)
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// Target host
    pub host: String,

    /// Target port
    pub port: u16,

    /// Username ("default" when unset on the target)
    #[serde(default)]
    pub username: String,

    /// Password — encrypted envelope at rest when a vault is configured,
    /// decrypted in memory after load
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Whether `password` currently holds an encrypted envelope
    #[serde(default)]
    pub password_encrypted: bool,

    /// Outcome of the last credential use
    #[serde(default)]
    pub credential_status: CredentialStatus,

    /// Cause retained when credentials failed (decryption or auth)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_error: Option<String>,

    /// Whether this is the default connection for requests without an id
    #[serde(default)]
    pub is_default: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConnectionConfig {
    /// Create a new config with a generated id and current timestamps
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        let now = Utc::now();
        Self {
            id: format!("conn-{}", uuid::Uuid::new_v4()),
            name: name.into(),
            host: host.into(),
            port,
            username: String::new(),
            password: None,
            password_encrypted: false,
            credential_status: CredentialStatus::Unknown,
            credential_error: None,
            is_default: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// True for the distinguished environment-derived config
    pub fn is_env_default(&self) -> bool {
        self.id == ENV_DEFAULT_ID
    }
}

/// Engine flavor reported by a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineFlavor {
    Valkey,
    Redis,
    Unknown,
}

/// Capability descriptor captured when a connection is established
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionCapabilities {
    pub flavor: EngineFlavor,

    /// Server version string (e.g. "8.0.1")
    pub version: String,

    /// COMMANDLOG is a Valkey 8.1+ feature
    #[serde(default)]
    pub has_command_log: bool,

    #[serde(default)]
    pub has_cluster_slot_stats: bool,

    #[serde(default)]
    pub has_acl_log: bool,
}

impl Default for ConnectionCapabilities {
    fn default() -> Self {
        Self {
            flavor: EngineFlavor::Unknown,
            version: String::new(),
            has_command_log: false,
            has_cluster_slot_stats: false,
            has_acl_log: true,
        }
    }
}

/// A named operation a target may or may not support/permit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    SlowLog,
    AclLog,
    CommandLog,
    ClusterSlotStats,
    Memory,
    ClientList,
    ClusterInfo,
    ConfigGet,
    Latency,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::SlowLog => "slowLog",
            Operation::AclLog => "aclLog",
            Operation::CommandLog => "commandLog",
            Operation::ClusterSlotStats => "clusterSlotStats",
            Operation::Memory => "memory",
            Operation::ClientList => "clientList",
            Operation::ClusterInfo => "clusterInfo",
            Operation::ConfigGet => "configGet",
            Operation::Latency => "latency",
        };
        f.write_str(name)
    }
}

/// One ACL LOG entry (an authentication or permission denial)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AclLogEntry {
    /// Denial count for this (user, context) pair as reported by the target
    pub count: u64,
    pub reason: String,
    pub context: String,
    pub object: String,
    pub username: String,
    /// Seconds since the entry was created, as reported by the target
    pub age_seconds: f64,
    pub client_info: String,
    /// Unix milliseconds when the entry was observed
    pub timestamp: u64,
}

/// One SLOWLOG entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlowLogEntry {
    /// Monotonically increasing entry id assigned by the target
    pub id: u64,
    /// Unix seconds when the command ran
    pub timestamp: u64,
    /// Execution time in microseconds
    pub duration_micros: u64,
    pub command: Vec<String>,
    pub client_addr: String,
    pub client_name: String,
}

/// Entry kind for COMMANDLOG (Valkey 8.1+)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandLogKind {
    Slow,
    LargeRequest,
    LargeReply,
}

impl fmt::Display for CommandLogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandLogKind::Slow => "slow",
            CommandLogKind::LargeRequest => "large-request",
            CommandLogKind::LargeReply => "large-reply",
        };
        f.write_str(name)
    }
}

/// One COMMANDLOG entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandLogEntry {
    pub id: u64,
    pub kind: CommandLogKind,
    pub timestamp: u64,
    /// Duration (slow) or size in bytes (large-request / large-reply)
    pub value: u64,
    pub command: Vec<String>,
    pub client_addr: String,
    pub client_name: String,
}

/// One row of CLIENT LIST output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRecord {
    pub id: u64,
    pub addr: String,
    pub name: String,
    pub age_seconds: u64,
    pub idle_seconds: u64,
    pub flags: String,
    pub db: u32,
    pub last_command: String,
    pub user: String,
}

/// Snapshot of CLIENT LIST persisted per tick
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSnapshot {
    pub connection_id: String,
    pub taken_at: DateTime<Utc>,
    pub total_clients: usize,
    pub clients: Vec<ClientRecord>,
}

/// A detected change to one configuration parameter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDiff {
    pub connection_id: String,
    pub parameter: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<String>,
    pub new_value: String,
    pub detected_at: DateTime<Utc>,
}

/// Retry behavior for one webhook
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Attempts after the first; 0 disables retries entirely
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_initial_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_multiplier: default_backoff_multiplier(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// Backoff delay in milliseconds before the attempt after `attempts`
    /// failures: `initial * multiplier^attempts`, capped at `max_delay_ms`
    pub fn delay_ms(&self, attempts: u32) -> u64 {
        let raw = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempts as i32);
        if raw.is_finite() {
            (raw as u64).min(self.max_delay_ms)
        } else {
            self.max_delay_ms
        }
    }
}

/// An outbound webhook endpoint registration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    /// Unique identifier (whk-<uuid>)
    pub id: String,

    pub url: String,

    /// HMAC-SHA256 signing secret; deliveries are unsigned when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Event types this webhook subscribes to (e.g. "acl.denied")
    #[serde(default)]
    pub events: Vec<String>,

    /// Extra headers sent with each delivery
    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default)]
    pub retry_policy: RetryPolicy,

    /// Per-request timeout in seconds, clamped to 1..=120 at dispatch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Cap on stored response body bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_response_bytes: Option<usize>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

impl WebhookConfig {
    /// Create a new enabled webhook with a generated id
    pub fn new(url: impl Into<String>, events: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: format!("whk-{}", uuid::Uuid::new_v4()),
            url: url.into(),
            secret: None,
            enabled: true,
            events,
            headers: HashMap::new(),
            retry_policy: RetryPolicy::default(),
            timeout_secs: None,
            max_response_bytes: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// True if this webhook should receive the given event type
    pub fn subscribes_to(&self, event_type: &str) -> bool {
        self.events.iter().any(|e| e == event_type)
    }
}

/// Delivery state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Success,
    Failed,
    Retrying,
    DeadLetter,
}

/// One delivery attempt record, mutated in place as attempts progress
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookDelivery {
    /// Unique identifier (dlv-<uuid>); receivers dedupe on this for
    /// exactly-once semantics over our at-least-once delivery
    pub id: String,

    pub webhook_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: DeliveryStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,

    /// Response body truncated to the webhook's configured cap
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,

    #[serde(default)]
    pub attempts: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookDelivery {
    /// Create a pending delivery for a webhook and event
    pub fn new(
        webhook_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: format!("dlv-{}", uuid::Uuid::new_v4()),
            webhook_id: webhook_id.into(),
            event_type: event_type.into(),
            payload,
            status: DeliveryStatus::Pending,
            status_code: None,
            response_body: None,
            attempts: 0,
            next_retry_at: None,
            duration_ms: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Terminal states accept no further attempts
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            DeliveryStatus::Success | DeliveryStatus::Failed | DeliveryStatus::DeadLetter
        )
    }
}
