//! Process configuration from environment variables
//!
//! Poll intervals are held in atomics so the management surface can adjust
//! them at runtime; polling loops read them fresh on every scheduling
//! decision rather than caching at start.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Environment variable enabling the credential vault
pub const ENV_MASTER_KEY: &str = "WATCH_MASTER_KEY";
/// Environment variables for the synthesized default target
pub const ENV_DEFAULT_HOST: &str = "WATCH_DEFAULT_HOST";
pub const ENV_DEFAULT_PORT: &str = "WATCH_DEFAULT_PORT";
pub const ENV_DEFAULT_USERNAME: &str = "WATCH_DEFAULT_USERNAME";
pub const ENV_DEFAULT_PASSWORD: &str = "WATCH_DEFAULT_PASSWORD";

/// A poll interval adjustable at runtime
#[derive(Debug)]
pub struct PollInterval {
    millis: AtomicU64,
}

impl PollInterval {
    pub fn new(millis: u64) -> Self {
        Self {
            millis: AtomicU64::new(millis),
        }
    }

    pub fn get(&self) -> Duration {
        Duration::from_millis(self.millis.load(Ordering::Relaxed))
    }

    pub fn set_millis(&self, millis: u64) {
        self.millis.store(millis.max(100), Ordering::Relaxed);
    }
}

/// Explicit host override supplied through the environment
#[derive(Debug, Clone)]
pub struct DefaultTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
}

/// Process-wide configuration
#[derive(Debug)]
pub struct WatchConfig {
    /// Operator-supplied master key; enables the credential vault
    pub master_key: Option<String>,

    /// Explicit default target, if supplied
    pub default_target: Option<DefaultTarget>,

    pub audit_interval: PollInterval,
    pub slowlog_interval: PollInterval,
    pub commandlog_interval: PollInterval,
    pub clients_interval: PollInterval,
    pub config_monitor_interval: PollInterval,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            master_key: None,
            default_target: None,
            audit_interval: PollInterval::new(15_000),
            slowlog_interval: PollInterval::new(30_000),
            commandlog_interval: PollInterval::new(30_000),
            clients_interval: PollInterval::new(60_000),
            config_monitor_interval: PollInterval::new(60_000),
        }
    }
}

impl WatchConfig {
    /// Build configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        config.master_key = std::env::var(ENV_MASTER_KEY).ok().filter(|k| !k.is_empty());
        if config.master_key.is_none() {
            tracing::warn!(
                "{} not set: credentials will be stored in plaintext",
                ENV_MASTER_KEY
            );
        }

        if let Ok(host) = std::env::var(ENV_DEFAULT_HOST) {
            if !host.is_empty() {
                let port = std::env::var(ENV_DEFAULT_PORT)
                    .ok()
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(6379);
                config.default_target = Some(DefaultTarget {
                    host,
                    port,
                    username: std::env::var(ENV_DEFAULT_USERNAME).unwrap_or_default(),
                    password: std::env::var(ENV_DEFAULT_PASSWORD).ok().filter(|p| !p.is_empty()),
                });
            }
        }

        for (var, interval) in [
            ("WATCH_AUDIT_INTERVAL_MS", &config.audit_interval),
            ("WATCH_SLOWLOG_INTERVAL_MS", &config.slowlog_interval),
            ("WATCH_COMMANDLOG_INTERVAL_MS", &config.commandlog_interval),
            ("WATCH_CLIENTS_INTERVAL_MS", &config.clients_interval),
            (
                "WATCH_CONFIG_MONITOR_INTERVAL_MS",
                &config.config_monitor_interval,
            ),
        ] {
            if let Some(ms) = std::env::var(var).ok().and_then(|v| v.parse().ok()) {
                interval.set_millis(ms);
            }
        }

        config
    }
}
