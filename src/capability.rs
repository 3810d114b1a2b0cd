//! Runtime capability tracker
//!
//! Stops polling loops from re-invoking a command the target has explicitly
//! rejected. State is in-memory only and rebuilt empirically after a process
//! restart, so a previously blocked operation gets re-probed once.

use crate::error::WatchError;
use crate::types::Operation;
use std::collections::HashMap;
use std::sync::RwLock;

/// Error substrings that mean the command is blocked, not failing transiently
const BLOCKED_PATTERNS: &[&str] = &[
    "unknown command",
    "unknown subcommand",
    "noperm",
    "no permission",
    "not allowed",
];

/// Per-connection operation availability, optimistic by default
#[derive(Default)]
pub struct CapabilityTracker {
    // connection id → operation → available
    state: RwLock<HashMap<String, HashMap<Operation, bool>>>,
}

impl CapabilityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Availability check; an absent entry means available
    pub fn is_available(&self, connection_id: &str, operation: Operation) -> bool {
        self.state
            .read()
            .map(|state| {
                state
                    .get(connection_id)
                    .and_then(|ops| ops.get(&operation))
                    .copied()
                    .unwrap_or(true)
            })
            .unwrap_or(true)
    }

    /// Classify an error; if it matches a blocked-command pattern, mark the
    /// operation unavailable and return true so the caller short-circuits.
    ///
    /// Transient errors return false and leave the flag untouched.
    pub fn record_failure(
        &self,
        connection_id: &str,
        operation: Operation,
        error: &WatchError,
    ) -> bool {
        if !is_blocked_error(error) {
            return false;
        }

        let mut state = match self.state.write() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        let ops = state.entry(connection_id.to_string()).or_default();
        let entry = ops.entry(operation).or_insert(true);
        if *entry {
            *entry = false;
            tracing::warn!(
                connection = %connection_id,
                operation = %operation,
                error = %error,
                "Operation blocked by target; disabling until reset"
            );
        }
        true
    }

    /// Forget all recorded state for a connection (after reconnect)
    pub fn reset_connection(&self, connection_id: &str) {
        if let Ok(mut state) = self.state.write() {
            if state.remove(connection_id).is_some() {
                tracing::info!(connection = %connection_id, "Capability state reset");
            }
        }
    }

    /// Forget all recorded state for a removed connection
    pub fn remove_connection(&self, connection_id: &str) {
        if let Ok(mut state) = self.state.write() {
            state.remove(connection_id);
        }
    }
}

fn is_blocked_error(error: &WatchError) -> bool {
    let message = error.to_string().to_lowercase();
    BLOCKED_PATTERNS.iter().any(|p| message.contains(p))
}
