//! Telemetry
//!
//! Metrics for the marketplace client. Logging goes through `tracing`.

pub mod metrics;

pub use metrics::{
    create_in_memory_metrics, no_op_metrics, ClientMetrics, InMemoryMetrics, MetricEntry,
    MetricLabels, NoOpMetrics,
};
