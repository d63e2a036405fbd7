//! Metrics
//!
//! Client metrics collection interfaces and implementations.

use parking_lot::Mutex;
use std::collections::HashMap;

/// Metric labels.
pub type MetricLabels = HashMap<String, String>;

/// Client metrics interface.
pub trait ClientMetrics: Send + Sync {
    /// Record an orchestrated call outcome.
    fn record_call(&self, endpoint_class: &str, success: bool);

    /// Record a retry attempt.
    fn record_retry(&self, endpoint_class: &str, attempt: u32, delay_ms: u64);

    /// Record a local quota rejection.
    fn record_rate_limit_rejection(&self, endpoint_class: &str);

    /// Record a circuit breaker state change.
    fn record_circuit_transition(&self, endpoint_class: &str, from: &str, to: &str);

    /// Record a token refresh.
    fn record_token_refresh(&self, success: bool);

    /// Record a token store tier failure.
    fn record_storage_failure(&self, tier: &str, operation: &str);

    /// Record a classified error.
    fn record_error(&self, category: &str, operation: &str);
}

/// No-op metrics implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpMetrics;

impl ClientMetrics for NoOpMetrics {
    fn record_call(&self, _endpoint_class: &str, _success: bool) {}
    fn record_retry(&self, _endpoint_class: &str, _attempt: u32, _delay_ms: u64) {}
    fn record_rate_limit_rejection(&self, _endpoint_class: &str) {}
    fn record_circuit_transition(&self, _endpoint_class: &str, _from: &str, _to: &str) {}
    fn record_token_refresh(&self, _success: bool) {}
    fn record_storage_failure(&self, _tier: &str, _operation: &str) {}
    fn record_error(&self, _category: &str, _operation: &str) {}
}

/// No-op metrics singleton.
pub fn no_op_metrics() -> NoOpMetrics {
    NoOpMetrics
}

/// Metric entry for in-memory storage.
#[derive(Debug, Clone)]
pub struct MetricEntry {
    pub name: String,
    pub value: f64,
    pub labels: MetricLabels,
}

/// In-memory metrics for testing.
#[derive(Default)]
pub struct InMemoryMetrics {
    entries: Mutex<Vec<MetricEntry>>,
}

impl InMemoryMetrics {
    /// Create new in-memory metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all recorded entries.
    pub fn get_entries(&self) -> Vec<MetricEntry> {
        self.entries.lock().clone()
    }

    /// Get entries by name.
    pub fn get_entries_by_name(&self, name: &str) -> Vec<MetricEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.name == name)
            .cloned()
            .collect()
    }

    /// Sum of values recorded under `name`.
    pub fn total(&self, name: &str) -> f64 {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.name == name)
            .map(|e| e.value)
            .sum()
    }

    /// Clear all entries.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    fn record(&self, name: &str, value: f64, labels: &[(&str, String)]) {
        let labels = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        self.entries.lock().push(MetricEntry {
            name: name.to_string(),
            value,
            labels,
        });
    }
}

impl ClientMetrics for InMemoryMetrics {
    fn record_call(&self, endpoint_class: &str, success: bool) {
        self.record(
            "marketplace_calls_total",
            1.0,
            &[
                ("endpoint_class", endpoint_class.to_string()),
                ("success", success.to_string()),
            ],
        );
    }

    fn record_retry(&self, endpoint_class: &str, attempt: u32, delay_ms: u64) {
        self.record(
            "marketplace_retries_total",
            1.0,
            &[
                ("endpoint_class", endpoint_class.to_string()),
                ("attempt", attempt.to_string()),
            ],
        );
        self.record(
            "marketplace_retry_delay_ms",
            delay_ms as f64,
            &[("endpoint_class", endpoint_class.to_string())],
        );
    }

    fn record_rate_limit_rejection(&self, endpoint_class: &str) {
        self.record(
            "marketplace_rate_limit_rejections_total",
            1.0,
            &[("endpoint_class", endpoint_class.to_string())],
        );
    }

    fn record_circuit_transition(&self, endpoint_class: &str, from: &str, to: &str) {
        self.record(
            "marketplace_circuit_transitions_total",
            1.0,
            &[
                ("endpoint_class", endpoint_class.to_string()),
                ("from", from.to_string()),
                ("to", to.to_string()),
            ],
        );
    }

    fn record_token_refresh(&self, success: bool) {
        self.record(
            "marketplace_token_refreshes_total",
            1.0,
            &[("success", success.to_string())],
        );
    }

    fn record_storage_failure(&self, tier: &str, operation: &str) {
        self.record(
            "marketplace_storage_failures_total",
            1.0,
            &[("tier", tier.to_string()), ("operation", operation.to_string())],
        );
    }

    fn record_error(&self, category: &str, operation: &str) {
        self.record(
            "marketplace_errors_total",
            1.0,
            &[
                ("category", category.to_string()),
                ("operation", operation.to_string()),
            ],
        );
    }
}

/// Create in-memory metrics for testing.
pub fn create_in_memory_metrics() -> InMemoryMetrics {
    InMemoryMetrics::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_op_metrics() {
        let metrics = no_op_metrics();
        metrics.record_call("sell", true);
        metrics.record_circuit_transition("sell", "closed", "open");
    }

    #[test]
    fn test_in_memory_metrics() {
        let metrics = InMemoryMetrics::new();

        metrics.record_call("sell", true);
        metrics.record_retry("sell", 2, 1500);

        assert_eq!(metrics.get_entries().len(), 3);
        let retries = metrics.get_entries_by_name("marketplace_retries_total");
        assert_eq!(retries.len(), 1);
        assert_eq!(retries[0].labels.get("attempt"), Some(&"2".to_string()));
        assert_eq!(metrics.total("marketplace_retry_delay_ms"), 1500.0);

        metrics.clear();
        assert!(metrics.get_entries().is_empty());
    }
}
