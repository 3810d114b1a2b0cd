//! Error types for valkey-watch

use thiserror::Error;

/// Errors that can occur while monitoring targets
#[derive(Debug, Error)]
pub enum WatchError {
    /// Target connection failure (network, refused, reset)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Credential rejection from the target (WRONGPASS, NOAUTH, ...)
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The target refused a command it does not support or permit
    #[error("Operation '{operation}' blocked on connection '{connection}': {reason}")]
    CapabilityBlocked {
        connection: String,
        operation: String,
        reason: String,
    },

    /// Credential vault failure
    #[error("Decryption error: {0}")]
    Decryption(#[from] DecryptionError),

    /// Storage backend failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Webhook delivery failure
    #[error("Delivery failed for webhook '{webhook}': {reason}")]
    Delivery { webhook: String, reason: String },

    /// HTTP transport failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Connection, webhook, or delivery not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),
}

/// Vault decryption failures, distinguished for operator diagnostics
///
/// `WrongKey` means the master key could not unwrap the data key;
/// `Tampered` means the data key unwrapped but the payload failed
/// authentication — the stored ciphertext was modified.
#[derive(Debug, Error)]
pub enum DecryptionError {
    /// Envelope version not understood by this build
    #[error("Unknown envelope version {0}")]
    UnknownVersion(u32),

    /// Master key does not match the key that encrypted this envelope
    #[error("Wrong master key: data key unwrap failed")]
    WrongKey,

    /// Payload ciphertext failed authentication with a valid data key
    #[error("Ciphertext tampered: payload authentication failed")]
    Tampered,

    /// Envelope structure could not be parsed
    #[error("Malformed envelope: {0}")]
    Malformed(String),
}

/// Result type alias for watch operations
pub type Result<T> = std::result::Result<T, WatchError>;

impl WatchError {
    /// True for errors worth retrying at the next tick without state changes
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            WatchError::Connection(_) | WatchError::Transport(_) | WatchError::Timeout(_)
        )
    }
}
