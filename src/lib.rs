//! # valkey-watch
//!
//! Connection-aware monitoring for Valkey and Redis deployments: audit-log
//! capture, slowlog and commandlog polling, client analytics, configuration
//! drift detection, and signed webhook delivery with bounded retries.
//!
//! ## Overview
//!
//! `valkey-watch` watches any number of target instances through a single
//! [`ConnectionRegistry`]. Feature pollers run on independent schedules and
//! fan out over every registered connection each tick; captured records land
//! behind the [`port::MonitorStore`] trait, and noteworthy events go out
//! through the [`WebhookEngine`].
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use valkey_watch::capability::CapabilityTracker;
//! use valkey_watch::config::WatchConfig;
//! use valkey_watch::port::memory::{MemoryClientFactory, MemoryStore};
//! use valkey_watch::registry::{ConnectionRegistry, ConnectionRequest};
//!
//! # async fn example() -> valkey_watch::Result<()> {
//! let registry = ConnectionRegistry::new(
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(MemoryClientFactory::new()),
//!     None, // no credential vault: plaintext storage, logged
//!     Arc::new(CapabilityTracker::new()),
//!     Arc::new(WatchConfig::default()),
//! );
//! registry.load().await?;
//!
//! let added = registry.add(ConnectionRequest {
//!     name: "prod-cache".into(),
//!     host: "10.0.0.5".into(),
//!     port: 6379,
//!     ..Default::default()
//! }).await?;
//!
//! println!("watching {}", added.id);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **port** — traits at the seams: [`port::TargetClient`] (wire protocol),
//!   [`port::MonitorStore`] (persistence), [`port::DeliveryTransport`] (HTTP)
//! - **registry** — connection lifecycle, default selection, credential flow
//! - **vault** — envelope encryption for stored credentials
//! - **capability** — runtime tracking of commands a target rejects
//! - **poller** — overlap-safe polling loops plus the feature pollers
//! - **delivery** — webhook dispatch, retry state machine, threshold gate

pub mod capability;
pub mod config;
pub mod delivery;
pub mod error;
pub mod poller;
pub mod port;
pub mod registry;
pub mod types;
pub mod vault;

// Re-export core types
pub use capability::CapabilityTracker;
pub use config::{PollInterval, WatchConfig};
pub use delivery::{HttpDeliveryTransport, ThresholdGate, WebhookEngine};
pub use error::{DecryptionError, Result, WatchError};
pub use poller::{
    AuditPoller, ClientsPoller, CommandLogPoller, ConfigMonitorPoller, ConnState, Poller,
    PollingLoop, SlowLogPoller,
};
pub use registry::{ConnectionRegistry, ConnectionRequest, LiveConnection};
pub use types::{
    AclLogEntry, ClientRecord, ClientSnapshot, CommandLogEntry, CommandLogKind, ConfigDiff,
    ConnectionCapabilities, ConnectionConfig, CredentialStatus, DeliveryStatus, EngineFlavor,
    Operation, RetryPolicy, SlowLogEntry, WebhookConfig, WebhookDelivery, ENV_DEFAULT_ID,
};
pub use vault::CredentialVault;
