// Prometheus metrics for the admission-control layer
//
// Exposes metrics on the /metrics HTTP endpoint:
// - Rate limit decisions per endpoint/scope (counter)
// - Store failures (counter)
// - Abuse events (counter)
// - Upstream quota usage and cool-down state (counter, gauges)
// - Retry attempts (counter)

use lazy_static::lazy_static;
use prometheus::{CounterVec, Encoder, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::sync::{Arc, Once};

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    // Inbound rate limiter
    pub static ref RATE_LIMIT_DECISIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("rate_limit_decisions_total", "Rate limit decisions by outcome"),
        &["endpoint", "scope", "outcome"]
    ).expect("Failed to create rate limit decisions metric");

    pub static ref RATE_LIMIT_STORE_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("rate_limit_store_errors_total", "Store failures during admission checks"),
        &["endpoint", "failure_mode"]
    ).expect("Failed to create store errors metric");

    pub static ref ABUSE_EVENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("abuse_events_total", "Requests denied by a rate limit policy"),
        &["endpoint", "scope"]
    ).expect("Failed to create abuse events metric");

    // Quota governor
    pub static ref QUOTA_UPSTREAM_CALLS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("quota_upstream_calls_total", "Upstream generation calls by outcome"),
        &["outcome"]
    ).expect("Failed to create upstream calls metric");

    pub static ref QUOTA_REQUESTS_TODAY: IntGauge = IntGauge::new(
        "quota_requests_today",
        "Successful upstream calls in the current day window"
    ).expect("Failed to create requests today metric");

    pub static ref QUOTA_COOLDOWN_ACTIVE: IntGauge = IntGauge::new(
        "quota_cooldown_active",
        "1 while the upstream provider has this process in a cool-down"
    ).expect("Failed to create cool-down metric");

    // Retry primitive
    pub static ref RETRY_ATTEMPTS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("retry_attempts_total", "Attempts made by the retry wrapper"),
        &["outcome"]
    ).expect("Failed to create retry attempts metric");

    // Free-form metrics recorded through Telemetry::record_metric
    pub static ref GUARD_METRIC_TOTAL: CounterVec = CounterVec::new(
        prometheus::Opts::new("guard_metric_total", "Named metrics recorded by the guard"),
        &["name", "unit"]
    ).expect("Failed to create guard metric");
}

static INIT: Once = Once::new();

/// Register every metric with [`REGISTRY`]
///
/// Safe to call more than once; only the first call registers.
pub fn init() -> prometheus::Result<()> {
    let mut result = Ok(());
    INIT.call_once(|| {
        result = register_all();
    });
    result
}

fn register_all() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(RATE_LIMIT_DECISIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RATE_LIMIT_STORE_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ABUSE_EVENTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(QUOTA_UPSTREAM_CALLS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(QUOTA_REQUESTS_TODAY.clone()))?;
    REGISTRY.register(Box::new(QUOTA_COOLDOWN_ACTIVE.clone()))?;
    REGISTRY.register(Box::new(RETRY_ATTEMPTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(GUARD_METRIC_TOTAL.clone()))?;
    Ok(())
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
}
