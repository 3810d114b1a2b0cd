//! Connection registry — single source of truth for monitored targets
//!
//! Owns every `ConnectionConfig` (decrypted in memory, encrypted at rest)
//! and every live client handle. All mutating operations are serialized by
//! one registry-wide mutex; reads work off snapshots.

use crate::capability::CapabilityTracker;
use crate::config::WatchConfig;
use crate::error::{Result, WatchError};
use crate::port::{ClientFactory, MonitorStore, TargetClient};
use crate::types::{
    ConnectionCapabilities, ConnectionConfig, CredentialStatus, ENV_DEFAULT_ID,
};
use crate::vault::CredentialVault;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Error message substrings that mean the target rejected the credentials
const AUTH_PATTERNS: &[&str] = &[
    "wrongpass",
    "noauth",
    "invalid username-password",
    "invalid password",
    "authentication",
];

/// Runtime handle for one configured target
///
/// Owned by the registry; pollers receive a clone per tick and must re-fetch
/// by id on the next tick rather than caching it.
#[derive(Clone)]
pub struct LiveConnection {
    pub id: String,
    pub client: Arc<dyn TargetClient>,
    pub capabilities: ConnectionCapabilities,
}

impl std::fmt::Debug for LiveConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveConnection")
            .field("id", &self.id)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

/// Request to create or pre-flight-test a connection
#[derive(Debug, Clone, Default)]
pub struct ConnectionRequest {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub set_as_default: bool,
}

pub struct ConnectionRegistry {
    store: Arc<dyn MonitorStore>,
    factory: Arc<dyn ClientFactory>,
    vault: Option<Arc<CredentialVault>>,
    tracker: Arc<CapabilityTracker>,
    config: Arc<WatchConfig>,
    connections: RwLock<HashMap<String, LiveConnection>>,
    configs: RwLock<HashMap<String, ConnectionConfig>>,
    default_id: RwLock<Option<String>>,
    /// Serializes add/remove/set_default/reconnect/load against each other
    mutation: Mutex<()>,
}

impl ConnectionRegistry {
    pub fn new(
        store: Arc<dyn MonitorStore>,
        factory: Arc<dyn ClientFactory>,
        vault: Option<Arc<CredentialVault>>,
        tracker: Arc<CapabilityTracker>,
        config: Arc<WatchConfig>,
    ) -> Self {
        if vault.is_none() {
            tracing::warn!("No credential vault configured: passwords are stored in plaintext");
        }
        Self {
            store,
            factory,
            vault,
            tracker,
            config,
            connections: RwLock::new(HashMap::new()),
            configs: RwLock::new(HashMap::new()),
            default_id: RwLock::new(None),
            mutation: Mutex::new(()),
        }
    }

    /// Load persisted configs and connect them, synthesizing the
    /// environment default when nothing is stored but a host override exists
    pub async fn load(&self) -> Result<()> {
        let _guard = self.mutation.lock().await;

        let stored = self
            .store
            .connections()
            .await
            .map_err(|e| WatchError::Persistence(format!("failed to load connections: {}", e)))?;

        if stored.is_empty() {
            match &self.config.default_target {
                Some(target) => {
                    let target = target.clone();
                    self.synthesize_env_default(target).await?;
                }
                None => {
                    tracing::info!(
                        "No stored connections and no host override; waiting for configuration"
                    );
                }
            }
        } else {
            self.load_stored(stored).await;
        }

        self.ensure_default_marked().await;
        Ok(())
    }

    async fn synthesize_env_default(&self, target: crate::config::DefaultTarget) -> Result<()> {
        let now = Utc::now();
        let mut config = ConnectionConfig {
            id: ENV_DEFAULT_ID.to_string(),
            name: "Environment default".to_string(),
            host: target.host,
            port: target.port,
            username: target.username,
            password: target.password,
            password_encrypted: false,
            credential_status: CredentialStatus::Unknown,
            credential_error: None,
            is_default: true,
            created_at: now,
            updated_at: now,
        };

        let client = self.factory.build(&config);
        match client.connect().await {
            Ok(()) => {
                config.credential_status = CredentialStatus::Valid;
                let capabilities = client.capabilities();
                self.connections.write().await.insert(
                    config.id.clone(),
                    LiveConnection {
                        id: config.id.clone(),
                        client,
                        capabilities,
                    },
                );
                tracing::info!(connection = ENV_DEFAULT_ID, "Environment default connected");
            }
            Err(e) => {
                // Retryable via reconnect; never fatal at startup
                let classified = classify_connect_error(e);
                if matches!(classified, WatchError::Authentication(_)) {
                    config.credential_status = CredentialStatus::Invalid;
                }
                config.credential_error = Some(classified.to_string());
                tracing::warn!(
                    connection = ENV_DEFAULT_ID,
                    error = %classified,
                    "Environment default failed to connect; reconnect to retry"
                );
            }
        }

        let stored = self.encrypt_for_storage(&config)?;
        self.store.save_connection(&stored).await?;
        self.configs.write().await.insert(config.id.clone(), config);
        *self.default_id.write().await = Some(ENV_DEFAULT_ID.to_string());
        Ok(())
    }

    async fn load_stored(&self, stored: Vec<ConnectionConfig>) {
        let mut to_connect = Vec::new();

        for mut config in stored {
            match self.decrypt_loaded(&mut config) {
                Ok(()) => to_connect.push(config),
                Err(e) => {
                    // Keep listed so the operator can fix the master key
                    // and reconnect without a restart
                    tracing::error!(
                        connection = %config.id,
                        error = %e,
                        "Stored credentials failed to decrypt; connection skipped"
                    );
                    config.credential_status = CredentialStatus::DecryptionFailed;
                    config.credential_error = Some(e.to_string());
                    self.configs
                        .write()
                        .await
                        .insert(config.id.clone(), config);
                }
            }
        }

        // Fan-out connect: one failing target never blocks the others
        let attempts = to_connect.into_iter().map(|config| {
            let client = self.factory.build(&config);
            async move {
                let result = client.connect().await;
                (config, client, result)
            }
        });

        for (mut config, client, result) in futures::future::join_all(attempts).await {
            match result {
                Ok(()) => {
                    config.credential_status = CredentialStatus::Valid;
                    config.credential_error = None;
                    tracing::info!(connection = %config.id, host = %config.host, "Connected");
                }
                Err(e) => {
                    let classified = classify_connect_error(e);
                    if matches!(classified, WatchError::Authentication(_)) {
                        config.credential_status = CredentialStatus::Invalid;
                    }
                    config.credential_error = Some(classified.to_string());
                    tracing::warn!(
                        connection = %config.id,
                        error = %classified,
                        "Connect failed at load"
                    );
                }
            }

            let capabilities = client.capabilities();
            self.connections.write().await.insert(
                config.id.clone(),
                LiveConnection {
                    id: config.id.clone(),
                    client,
                    capabilities,
                },
            );
            if config.is_default {
                *self.default_id.write().await = Some(config.id.clone());
            }
            self.configs
                .write()
                .await
                .insert(config.id.clone(), config);
        }
    }

    /// Promote the first loaded config when nothing is marked default
    async fn ensure_default_marked(&self) {
        if self.default_id.read().await.is_some() {
            return;
        }

        let first = {
            let configs = self.configs.read().await;
            let mut ordered: Vec<_> = configs.values().collect();
            ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            ordered.first().map(|c| c.id.clone())
        };

        if let Some(id) = first {
            if let Err(e) = self.mark_default(&id).await {
                tracing::warn!(connection = %id, error = %e, "Failed to persist default promotion");
            } else {
                tracing::info!(connection = %id, "Promoted to default connection");
            }
        }
    }

    /// Resolve the live handle for an explicit id, or the default
    pub async fn get(&self, id: Option<&str>) -> Result<LiveConnection> {
        let resolved = match id {
            Some(id) => id.to_string(),
            None => self.default_id.read().await.clone().ok_or_else(|| {
                WatchError::NotFound(
                    "no connection id given and no default connection configured".to_string(),
                )
            })?,
        };

        self.connections
            .read()
            .await
            .get(&resolved)
            .cloned()
            .ok_or_else(|| WatchError::NotFound(format!("connection '{}' not found", resolved)))
    }

    /// Validate by connecting a trial adapter, then persist and keep it
    pub async fn add(&self, request: ConnectionRequest) -> Result<ConnectionConfig> {
        let _guard = self.mutation.lock().await;

        let mut config = ConnectionConfig::new(request.name, request.host, request.port);
        config.username = request.username;
        config.password = request.password;

        // Trial connect before anything is persisted
        let client = self.factory.build(&config);
        client.connect().await.map_err(classify_connect_error)?;
        config.credential_status = CredentialStatus::Valid;

        let stored = self.encrypt_for_storage(&config)?;
        if let Err(e) = self.store.save_connection(&stored).await {
            // Don't leak a live adapter when persistence fails
            if let Err(disc) = client.disconnect().await {
                tracing::warn!(connection = %config.id, error = %disc, "Disconnect after failed save");
            }
            return Err(WatchError::Persistence(format!(
                "failed to persist connection '{}': {}",
                config.id, e
            )));
        }

        let capabilities = client.capabilities();
        self.connections.write().await.insert(
            config.id.clone(),
            LiveConnection {
                id: config.id.clone(),
                client,
                capabilities,
            },
        );
        self.configs
            .write()
            .await
            .insert(config.id.clone(), config.clone());

        let no_default = self.default_id.read().await.is_none();
        if request.set_as_default || no_default {
            self.mark_default(&config.id).await?;
            config.is_default = true;
        }

        tracing::info!(connection = %config.id, name = %config.name, "Connection added");
        Ok(config)
    }

    /// Remove a connection; the environment default can only be reconnected
    pub async fn remove(&self, id: &str) -> Result<()> {
        let _guard = self.mutation.lock().await;

        if id == ENV_DEFAULT_ID {
            return Err(WatchError::Config(format!(
                "connection '{}' is derived from the environment and cannot be removed",
                ENV_DEFAULT_ID
            )));
        }
        if !self.configs.read().await.contains_key(id) {
            return Err(WatchError::NotFound(format!("connection '{}' not found", id)));
        }

        // Disconnect only if currently connected
        let live = self.connections.write().await.remove(id);
        if let Some(live) = live {
            if live.client.is_connected() {
                if let Err(e) = live.client.disconnect().await {
                    tracing::warn!(connection = %id, error = %e, "Disconnect during remove");
                }
            }
        }

        self.configs.write().await.remove(id);
        self.store.delete_connection(id).await?;
        self.tracker.remove_connection(id);

        let was_default = self.default_id.read().await.as_deref() == Some(id);
        if was_default {
            *self.default_id.write().await = None;
            self.ensure_default_marked().await;
        }

        tracing::info!(connection = %id, "Connection removed");
        Ok(())
    }

    /// Make one connection the default, unmarking the previous one first
    pub async fn set_default(&self, id: &str) -> Result<()> {
        let _guard = self.mutation.lock().await;

        if !self.configs.read().await.contains_key(id) {
            return Err(WatchError::NotFound(format!("connection '{}' not found", id)));
        }
        self.mark_default(id).await
    }

    async fn mark_default(&self, id: &str) -> Result<()> {
        let previous = self.default_id.read().await.clone();
        if previous.as_deref() == Some(id) {
            return Ok(());
        }

        // Unmark the old default before marking the new one so no state
        // ever shows two defaults
        if let Some(previous) = previous {
            let unmarked = {
                let mut configs = self.configs.write().await;
                configs.get_mut(&previous).map(|config| {
                    config.is_default = false;
                    config.updated_at = Utc::now();
                    config.clone()
                })
            };
            if let Some(unmarked) = unmarked {
                let stored = self.encrypt_for_storage(&unmarked)?;
                self.store.update_connection(&stored).await?;
            }
        }

        let marked = {
            let mut configs = self.configs.write().await;
            let config = configs.get_mut(id).ok_or_else(|| {
                WatchError::NotFound(format!("connection '{}' not found", id))
            })?;
            config.is_default = true;
            config.updated_at = Utc::now();
            config.clone()
        };
        let stored = self.encrypt_for_storage(&marked)?;
        self.store.update_connection(&stored).await?;

        *self.default_id.write().await = Some(id.to_string());
        Ok(())
    }

    /// Rebuild and connect a fresh adapter, keeping the old one until the
    /// new one is up
    pub async fn reconnect(&self, id: &str) -> Result<ConnectionConfig> {
        let _guard = self.mutation.lock().await;

        let mut config = self
            .configs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| WatchError::NotFound(format!("connection '{}' not found", id)))?;

        // A fixed master key is picked up here without a restart
        if config.credential_status == CredentialStatus::DecryptionFailed {
            let stored = self
                .store
                .connections()
                .await?
                .into_iter()
                .find(|c| c.id == id)
                .ok_or_else(|| {
                    WatchError::NotFound(format!("connection '{}' not found in store", id))
                })?;

            let mut reread = stored;
            self.decrypt_loaded(&mut reread).map_err(|e| {
                tracing::error!(connection = %id, error = %e, "Credentials still undecryptable");
                e
            })?;
            reread.credential_status = CredentialStatus::Unknown;
            reread.credential_error = None;
            config = reread;
        }

        let client = self.factory.build(&config);
        match client.connect().await {
            Ok(()) => {
                // Tear down the old handle only after the new one is live
                let old = self
                    .connections
                    .write()
                    .await
                    .remove(id);
                if let Some(old) = old {
                    if old.client.is_connected() {
                        if let Err(e) = old.client.disconnect().await {
                            tracing::warn!(connection = %id, error = %e, "Old handle disconnect");
                        }
                    }
                }

                config.credential_status = CredentialStatus::Valid;
                config.credential_error = None;
                config.updated_at = Utc::now();

                let capabilities = client.capabilities();
                self.connections.write().await.insert(
                    id.to_string(),
                    LiveConnection {
                        id: id.to_string(),
                        client,
                        capabilities,
                    },
                );
                self.tracker.reset_connection(id);

                let stored = self.encrypt_for_storage(&config)?;
                self.store.update_connection(&stored).await?;
                self.configs
                    .write()
                    .await
                    .insert(id.to_string(), config.clone());

                tracing::info!(connection = %id, "Reconnected");
                Ok(config)
            }
            Err(e) => {
                // Previous (possibly still-good) connection stays intact
                let classified = classify_connect_error(e);
                if matches!(classified, WatchError::Authentication(_)) {
                    config.credential_status = CredentialStatus::Invalid;
                }
                config.credential_error = Some(classified.to_string());
                config.updated_at = Utc::now();

                let stored = self.encrypt_for_storage(&config)?;
                if let Err(persist) = self.store.update_connection(&stored).await {
                    tracing::warn!(connection = %id, error = %persist, "Failed to persist reconnect outcome");
                }
                self.configs
                    .write()
                    .await
                    .insert(id.to_string(), config);

                tracing::warn!(connection = %id, error = %classified, "Reconnect failed");
                Err(classified)
            }
        }
    }

    /// Pre-flight validation: connect a throwaway adapter, capture
    /// capabilities, disconnect. Never persists.
    pub async fn test_connection(
        &self,
        request: ConnectionRequest,
    ) -> Result<ConnectionCapabilities> {
        let mut config = ConnectionConfig::new(request.name, request.host, request.port);
        config.username = request.username;
        config.password = request.password;

        let client = self.factory.build(&config);
        client.connect().await.map_err(classify_connect_error)?;
        let capabilities = client.capabilities();
        if let Err(e) = client.disconnect().await {
            tracing::warn!(error = %e, "Throwaway adapter disconnect");
        }
        Ok(capabilities)
    }

    /// Disconnect everything in parallel and clear all in-memory state
    pub async fn shutdown(&self) {
        let _guard = self.mutation.lock().await;

        let handles: Vec<LiveConnection> = {
            let connections = self.connections.read().await;
            connections.values().cloned().collect()
        };

        let disconnects = handles.into_iter().map(|live| async move {
            if let Err(e) = live.client.disconnect().await {
                tracing::warn!(connection = %live.id, error = %e, "Disconnect during shutdown");
            }
        });
        futures::future::join_all(disconnects).await;

        self.connections.write().await.clear();
        self.configs.write().await.clear();
        *self.default_id.write().await = None;
        tracing::info!("Connection registry shut down");
    }

    /// All configs as held in memory (decrypted)
    pub async fn list(&self) -> Vec<ConnectionConfig> {
        let configs = self.configs.read().await;
        let mut out: Vec<_> = configs.values().cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        out
    }

    /// Live handles for the current tick; never cache across ticks
    pub async fn snapshot(&self) -> Vec<LiveConnection> {
        self.connections.read().await.values().cloned().collect()
    }

    pub async fn default_connection_id(&self) -> Option<String> {
        self.default_id.read().await.clone()
    }

    pub async fn is_connected(&self, id: &str) -> bool {
        self.connections
            .read()
            .await
            .get(id)
            .map(|live| live.client.is_connected())
            .unwrap_or(false)
    }

    fn encrypt_for_storage(&self, config: &ConnectionConfig) -> Result<ConnectionConfig> {
        let mut stored = config.clone();
        if let Some(password) = &config.password {
            match &self.vault {
                Some(vault) => {
                    stored.password = Some(vault.encrypt(password)?);
                    stored.password_encrypted = true;
                }
                None => {
                    tracing::warn!(
                        connection = %config.id,
                        "Storing password in plaintext: no master key configured"
                    );
                    stored.password_encrypted = false;
                }
            }
        }
        Ok(stored)
    }

    fn decrypt_loaded(&self, config: &mut ConnectionConfig) -> Result<()> {
        if !config.password_encrypted {
            return Ok(());
        }
        let envelope = match &config.password {
            Some(envelope) => envelope.clone(),
            None => return Ok(()),
        };
        let vault = self.vault.as_ref().ok_or_else(|| {
            WatchError::Config(format!(
                "connection '{}' has encrypted credentials but no master key is configured",
                config.id
            ))
        })?;
        config.password = Some(vault.decrypt(&envelope)?);
        config.password_encrypted = false;
        Ok(())
    }
}

fn classify_connect_error(error: WatchError) -> WatchError {
    let message = error.to_string();
    let lowered = message.to_lowercase();
    if AUTH_PATTERNS.iter().any(|p| lowered.contains(p)) {
        WatchError::Authentication(message)
    } else {
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DefaultTarget;
    use crate::port::memory::{MemoryClientFactory, MemoryStore, MemoryTargetClient};

    struct Fixture {
        store: Arc<MemoryStore>,
        factory: Arc<MemoryClientFactory>,
        registry: ConnectionRegistry,
    }

    fn fixture_with(vault: Option<Arc<CredentialVault>>, config: WatchConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let factory = Arc::new(MemoryClientFactory::new());
        let registry = ConnectionRegistry::new(
            store.clone(),
            factory.clone(),
            vault,
            Arc::new(CapabilityTracker::new()),
            Arc::new(config),
        );
        Fixture {
            store,
            factory,
            registry,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(None, WatchConfig::default())
    }

    fn request(name: &str, host: &str) -> ConnectionRequest {
        ConnectionRequest {
            name: name.to_string(),
            host: host.to_string(),
            port: 6379,
            username: String::new(),
            password: None,
            set_as_default: false,
        }
    }

    #[tokio::test]
    async fn test_add_connects_then_persists() {
        let f = fixture();
        let added = f.registry.add(request("cache-a", "10.0.0.1")).await.unwrap();

        assert_eq!(added.credential_status, CredentialStatus::Valid);
        assert!(added.is_default, "first connection becomes default");
        assert_eq!(f.store.connections().await.unwrap().len(), 1);
        assert!(f.registry.is_connected(&added.id).await);
    }

    #[tokio::test]
    async fn test_add_failed_connect_persists_nothing() {
        let f = fixture();
        let client = Arc::new(MemoryTargetClient::new());
        client.fail_connect("connection refused");
        f.factory.register("10.0.0.2", 6379, client);

        let err = f.registry.add(request("bad", "10.0.0.2")).await.unwrap_err();
        assert!(matches!(err, WatchError::Connection(_)));
        assert!(f.store.connections().await.unwrap().is_empty());
        assert!(f.registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_add_auth_error_classified() {
        let f = fixture();
        let client = Arc::new(MemoryTargetClient::new());
        client.fail_connect("WRONGPASS invalid username-password pair");
        f.factory.register("10.0.0.3", 6379, client);

        let err = f.registry.add(request("auth", "10.0.0.3")).await.unwrap_err();
        assert!(matches!(err, WatchError::Authentication(_)));
    }

    #[tokio::test]
    async fn test_add_persist_failure_disconnects_trial_adapter() {
        let f = fixture();
        let client = Arc::new(MemoryTargetClient::new());
        f.factory.register("10.0.0.4", 6379, client.clone());
        f.store.set_fail_writes(true);

        let err = f.registry.add(request("c", "10.0.0.4")).await.unwrap_err();
        assert!(matches!(err, WatchError::Persistence(_)));
        assert!(!client.is_connected(), "trial adapter must not leak");
    }

    #[tokio::test]
    async fn test_get_by_id_and_default() {
        let f = fixture();
        let a = f.registry.add(request("a", "10.0.0.1")).await.unwrap();
        let b = f.registry.add(request("b", "10.0.0.2")).await.unwrap();

        assert_eq!(f.registry.get(Some(&b.id)).await.unwrap().id, b.id);
        // First added is default
        assert_eq!(f.registry.get(None).await.unwrap().id, a.id);
    }

    #[tokio::test]
    async fn test_get_not_found_names_the_id() {
        let f = fixture();
        let err = f.registry.get(Some("conn-ghost")).await.unwrap_err();
        assert!(err.to_string().contains("conn-ghost"));

        let err = f.registry.get(None).await.unwrap_err();
        assert!(err.to_string().contains("no default"));
    }

    #[tokio::test]
    async fn test_default_uniqueness_across_mutations() {
        let f = fixture();
        let a = f.registry.add(request("a", "10.0.0.1")).await.unwrap();
        let b = f.registry.add(request("b", "10.0.0.2")).await.unwrap();
        let c = f.registry.add(request("c", "10.0.0.3")).await.unwrap();

        f.registry.set_default(&b.id).await.unwrap();
        f.registry.set_default(&c.id).await.unwrap();
        f.registry.remove(&c.id).await.unwrap();
        f.registry.set_default(&a.id).await.unwrap();

        let defaults: Vec<_> = f
            .registry
            .list()
            .await
            .into_iter()
            .filter(|cfg| cfg.is_default)
            .collect();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].id, a.id);

        let stored_defaults = f
            .store
            .connections()
            .await
            .unwrap()
            .into_iter()
            .filter(|cfg| cfg.is_default)
            .count();
        assert_eq!(stored_defaults, 1);

        let _ = b;
    }

    #[tokio::test]
    async fn test_remove_promotes_next_default() {
        let f = fixture();
        let a = f.registry.add(request("a", "10.0.0.1")).await.unwrap();
        let b = f.registry.add(request("b", "10.0.0.2")).await.unwrap();

        f.registry.remove(&a.id).await.unwrap();
        assert_eq!(f.registry.default_connection_id().await, Some(b.id.clone()));

        f.registry.remove(&b.id).await.unwrap();
        assert_eq!(f.registry.default_connection_id().await, None);
    }

    #[tokio::test]
    async fn test_remove_env_default_forbidden() {
        let config = WatchConfig {
            default_target: Some(DefaultTarget {
                host: "localhost".to_string(),
                port: 6379,
                username: String::new(),
                password: None,
            }),
            ..WatchConfig::default()
        };
        let f = fixture_with(None, config);
        f.registry.load().await.unwrap();

        let before = f.registry.list().await;
        let err = f.registry.remove(ENV_DEFAULT_ID).await.unwrap_err();
        assert!(matches!(err, WatchError::Config(_)));
        // No mutation
        assert_eq!(f.registry.list().await.len(), before.len());
        assert_eq!(
            f.registry.default_connection_id().await,
            Some(ENV_DEFAULT_ID.to_string())
        );
    }

    #[tokio::test]
    async fn test_load_empty_with_override_synthesizes_env_default() {
        let config = WatchConfig {
            default_target: Some(DefaultTarget {
                host: "cache.internal".to_string(),
                port: 6380,
                username: "monitor".to_string(),
                password: Some("hunter2-hunter2".to_string()),
            }),
            ..WatchConfig::default()
        };
        let vault = Arc::new(CredentialVault::new("a master key with length").unwrap());
        let f = fixture_with(Some(vault.clone()), config);

        f.registry.load().await.unwrap();

        let configs = f.registry.list().await;
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].id, ENV_DEFAULT_ID);
        assert!(configs[0].is_default);
        assert!(f.registry.is_connected(ENV_DEFAULT_ID).await);

        // Persisted encrypted
        let stored = f.store.connections().await.unwrap();
        assert!(stored[0].password_encrypted);
        let envelope = stored[0].password.as_deref().unwrap();
        assert!(CredentialVault::is_encrypted(envelope));
        assert_eq!(vault.decrypt(envelope).unwrap(), "hunter2-hunter2");
    }

    #[tokio::test]
    async fn test_load_empty_with_override_no_vault_plaintext() {
        let config = WatchConfig {
            default_target: Some(DefaultTarget {
                host: "cache.internal".to_string(),
                port: 6379,
                username: String::new(),
                password: Some("plain-secret".to_string()),
            }),
            ..WatchConfig::default()
        };
        let f = fixture_with(None, config);
        f.registry.load().await.unwrap();

        let stored = f.store.connections().await.unwrap();
        assert!(!stored[0].password_encrypted);
        assert_eq!(stored[0].password.as_deref(), Some("plain-secret"));
    }

    #[tokio::test]
    async fn test_load_empty_without_override_waits() {
        let f = fixture();
        f.registry.load().await.unwrap();
        assert!(f.registry.list().await.is_empty());
        assert_eq!(f.registry.default_connection_id().await, None);
    }

    #[tokio::test]
    async fn test_load_env_default_connect_failure_is_retryable() {
        let config = WatchConfig {
            default_target: Some(DefaultTarget {
                host: "down.internal".to_string(),
                port: 6379,
                username: String::new(),
                password: None,
            }),
            ..WatchConfig::default()
        };
        let f = fixture_with(None, config);
        let client = Arc::new(MemoryTargetClient::new());
        client.fail_connect("connection refused");
        f.factory.register("down.internal", 6379, client.clone());

        f.registry.load().await.unwrap();

        let configs = f.registry.list().await;
        assert_eq!(configs.len(), 1);
        assert!(configs[0].credential_error.is_some());
        assert!(!f.registry.is_connected(ENV_DEFAULT_ID).await);

        // Operator fixes the target, reconnect succeeds
        client.allow_connect();
        let reconnected = f.registry.reconnect(ENV_DEFAULT_ID).await.unwrap();
        assert_eq!(reconnected.credential_status, CredentialStatus::Valid);
        assert!(f.registry.is_connected(ENV_DEFAULT_ID).await);
    }

    #[tokio::test]
    async fn test_load_isolates_per_connection_failures() {
        let f = fixture();
        let good = f.registry.add(request("good", "10.0.0.1")).await.unwrap();
        let bad = f.registry.add(request("bad", "10.0.0.2")).await.unwrap();
        f.registry.shutdown().await;

        let bad_client = Arc::new(MemoryTargetClient::new());
        bad_client.fail_connect("connection refused");
        f.factory.register("10.0.0.2", 6379, bad_client);

        f.registry.load().await.unwrap();
        assert!(f.registry.is_connected(&good.id).await);
        assert!(!f.registry.is_connected(&bad.id).await);
        assert_eq!(f.registry.list().await.len(), 2);
    }

    #[tokio::test]
    async fn test_decryption_failure_marks_and_keeps_config() {
        let vault_a = Arc::new(CredentialVault::new("first master key ok").unwrap());
        let f = fixture_with(Some(vault_a), WatchConfig::default());
        f.registry
            .add(ConnectionRequest {
                password: Some("secret-password".to_string()),
                ..request("enc", "10.0.0.1")
            })
            .await
            .unwrap();
        f.registry.shutdown().await;

        // Same store, wrong master key
        let vault_b = Arc::new(CredentialVault::new("second master key !!").unwrap());
        let registry2 = ConnectionRegistry::new(
            f.store.clone(),
            f.factory.clone(),
            Some(vault_b),
            Arc::new(CapabilityTracker::new()),
            Arc::new(WatchConfig::default()),
        );
        registry2.load().await.unwrap();

        let configs = registry2.list().await;
        assert_eq!(configs.len(), 1);
        assert_eq!(
            configs[0].credential_status,
            CredentialStatus::DecryptionFailed
        );
        assert!(configs[0].credential_error.is_some());
        assert!(!registry2.is_connected(&configs[0].id).await);
    }

    #[tokio::test]
    async fn test_reconnect_after_master_key_fix() {
        let vault = Arc::new(CredentialVault::new("the real master key").unwrap());
        let f = fixture_with(Some(vault.clone()), WatchConfig::default());
        let added = f
            .registry
            .add(ConnectionRequest {
                password: Some("secret-password".to_string()),
                ..request("enc", "10.0.0.1")
            })
            .await
            .unwrap();
        f.registry.shutdown().await;

        // Load with the wrong key: decryption fails
        let wrong = Arc::new(CredentialVault::new("not the right key!").unwrap());
        let registry2 = ConnectionRegistry::new(
            f.store.clone(),
            f.factory.clone(),
            Some(wrong),
            Arc::new(CapabilityTracker::new()),
            Arc::new(WatchConfig::default()),
        );
        registry2.load().await.unwrap();
        assert_eq!(
            registry2.list().await[0].credential_status,
            CredentialStatus::DecryptionFailed
        );

        // Operator fixes the key (new registry with correct vault), config
        // still marked failed in the store is re-read and decrypted
        let registry3 = ConnectionRegistry::new(
            f.store.clone(),
            f.factory.clone(),
            Some(vault),
            Arc::new(CapabilityTracker::new()),
            Arc::new(WatchConfig::default()),
        );
        registry3.load().await.unwrap();
        let reconnected = registry3.reconnect(&added.id).await.unwrap();
        assert_eq!(reconnected.credential_status, CredentialStatus::Valid);
    }

    #[tokio::test]
    async fn test_reconnect_failure_keeps_old_connection() {
        let f = fixture();
        let client = Arc::new(MemoryTargetClient::new());
        f.factory.register("10.0.0.9", 6379, client.clone());
        let added = f.registry.add(request("c", "10.0.0.9")).await.unwrap();
        assert!(f.registry.is_connected(&added.id).await);

        // The factory hands back the same client; scripted failure makes the
        // new connect attempt fail while the existing handle stays connected
        client.fail_connect("connection refused");
        let err = f.registry.reconnect(&added.id).await.unwrap_err();
        assert!(matches!(err, WatchError::Connection(_)));
        assert!(
            f.registry.is_connected(&added.id).await,
            "failed reconnect must not tear down the live handle"
        );
    }

    #[tokio::test]
    async fn test_reconnect_auth_failure_marks_invalid() {
        let f = fixture();
        let client = Arc::new(MemoryTargetClient::new());
        f.factory.register("10.0.0.9", 6379, client.clone());
        let added = f.registry.add(request("c", "10.0.0.9")).await.unwrap();

        client.fail_connect("NOAUTH Authentication required");
        let err = f.registry.reconnect(&added.id).await.unwrap_err();
        assert!(matches!(err, WatchError::Authentication(_)));

        let config = f
            .registry
            .list()
            .await
            .into_iter()
            .find(|c| c.id == added.id)
            .unwrap();
        assert_eq!(config.credential_status, CredentialStatus::Invalid);
        assert!(config.credential_error.is_some());
    }

    #[tokio::test]
    async fn test_test_connection_never_persists() {
        let f = fixture();
        let client = Arc::new(MemoryTargetClient::new());
        f.factory.register("probe.internal", 6379, client.clone());

        let caps = f
            .registry
            .test_connection(request("probe", "probe.internal"))
            .await
            .unwrap();
        let _ = caps;
        assert!(f.store.connections().await.unwrap().is_empty());
        assert!(!client.is_connected(), "throwaway adapter is disconnected");
    }

    #[tokio::test]
    async fn test_shutdown_clears_state() {
        let f = fixture();
        f.registry.add(request("a", "10.0.0.1")).await.unwrap();
        f.registry.add(request("b", "10.0.0.2")).await.unwrap();

        f.registry.shutdown().await;
        assert!(f.registry.list().await.is_empty());
        assert!(f.registry.snapshot().await.is_empty());
        assert_eq!(f.registry.default_connection_id().await, None);
    }
}
