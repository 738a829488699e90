//! Logging and Metrics Sink
//!
//! The limiter and governor report operational events through [`Telemetry`]
//! rather than talking to a logging backend directly. [`TracingTelemetry`]
//! forwards to `tracing` and the Prometheus registry; [`MemoryTelemetry`]
//! keeps everything in memory for assertions.

use serde::Serialize;
use serde_json::Value;
use std::sync::Mutex;

use crate::metrics::GUARD_METRIC_TOTAL;

/// Structured error log and metric sink
pub trait Telemetry: Send + Sync {
    /// Record a failed operation with free-form context
    fn log_error(&self, operation: &str, error: &dyn std::error::Error, context: Value);

    /// Record a named metric sample
    fn record_metric(&self, name: &str, value: f64, unit: &str, tags: &[(&str, &str)]);
}

/// Sink backed by `tracing` and the Prometheus registry
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

impl Telemetry for TracingTelemetry {
    fn log_error(&self, operation: &str, error: &dyn std::error::Error, context: Value) {
        tracing::error!(operation, error = %error, context = %context, "Operation failed");
    }

    fn record_metric(&self, name: &str, value: f64, unit: &str, tags: &[(&str, &str)]) {
        if value >= 0.0 {
            GUARD_METRIC_TOTAL
                .with_label_values(&[name, unit])
                .inc_by(value);
        }
        tracing::debug!(metric = name, value, unit, tags = ?tags, "Metric recorded");
    }
}

/// Metric captured by [`MemoryTelemetry`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordedMetric {
    pub name: String,
    pub value: f64,
    pub unit: String,
    pub tags: Vec<(String, String)>,
}

impl RecordedMetric {
    /// Value of a tag, if present
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Error captured by [`MemoryTelemetry`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordedError {
    pub operation: String,
    pub message: String,
    pub context: Value,
}

/// In-memory sink
#[derive(Debug, Default)]
pub struct MemoryTelemetry {
    metrics: Mutex<Vec<RecordedMetric>>,
    errors: Mutex<Vec<RecordedError>>,
}

impl MemoryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metrics recorded so far
    pub fn metrics(&self) -> Vec<RecordedMetric> {
        self.metrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Metrics recorded under `name`
    pub fn metrics_named(&self, name: &str) -> Vec<RecordedMetric> {
        self.metrics()
            .into_iter()
            .filter(|m| m.name == name)
            .collect()
    }

    /// Errors recorded so far
    pub fn errors(&self) -> Vec<RecordedError> {
        self.errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Telemetry for MemoryTelemetry {
    fn log_error(&self, operation: &str, error: &dyn std::error::Error, context: Value) {
        self.errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedError {
                operation: operation.to_string(),
                message: error.to_string(),
                context,
            });
    }

    fn record_metric(&self, name: &str, value: f64, unit: &str, tags: &[(&str, &str)]) {
        self.metrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedMetric {
                name: name.to_string(),
                value,
                unit: unit.to_string(),
                tags: tags
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            });
    }
}
