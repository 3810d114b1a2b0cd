//! Hysteresis gate for threshold alerts
//!
//! A metric hovering around its threshold must not fire an alert on every
//! tick. The gate fires once when the value crosses the threshold and only
//! re-arms after the value drops clearly below it.

use std::collections::HashMap;
use std::sync::RwLock;

const DEFAULT_HYSTERESIS_FACTOR: f64 = 0.9;

/// Per-(connection, metric) fired flags
pub struct ThresholdGate {
    hysteresis_factor: f64,
    fired: RwLock<HashMap<(String, String), bool>>,
}

impl Default for ThresholdGate {
    fn default() -> Self {
        Self::new(DEFAULT_HYSTERESIS_FACTOR)
    }
}

impl ThresholdGate {
    /// `hysteresis_factor` is the re-arm fraction of the threshold
    pub fn new(hysteresis_factor: f64) -> Self {
        Self {
            hysteresis_factor: hysteresis_factor.clamp(0.0, 1.0),
            fired: RwLock::new(HashMap::new()),
        }
    }

    /// Observe one reading. Returns true when an alert should fire now.
    pub fn observe(
        &self,
        connection_id: &str,
        metric: &str,
        value: f64,
        threshold: f64,
    ) -> bool {
        let key = (connection_id.to_string(), metric.to_string());
        let mut fired = match self.fired.write() {
            Ok(fired) => fired,
            Err(poisoned) => poisoned.into_inner(),
        };
        let flag = fired.entry(key).or_insert(false);

        if *flag {
            if value < threshold * self.hysteresis_factor {
                *flag = false;
                tracing::debug!(
                    connection = %connection_id,
                    metric = %metric,
                    value,
                    "Threshold gate re-armed"
                );
            }
            return false;
        }

        if value >= threshold {
            *flag = true;
            return true;
        }
        false
    }

    pub fn remove_connection(&self, connection_id: &str) {
        let mut fired = match self.fired.write() {
            Ok(fired) => fired,
            Err(poisoned) => poisoned.into_inner(),
        };
        fired.retain(|(conn, _), _| conn != connection_id);
    }
}
