//! Inbound Rate Limiter
//!
//! Enforces per-user, per-IP and global policies for logical endpoints.
//! Every read that feeds an admission decision happens inside a single store
//! transaction on that key's document; concurrent handlers (in this process
//! or another) are serialized only by the store.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

use super::config::{EndpointPolicy, FailureMode, RateLimitConfig, ScopePolicy, Strategy};
use super::error::{RateLimitError, StoreError};
use super::headers::RateLimitHeaders;
use super::key::{RateLimitKey, Scope, GLOBAL_IDENTIFIER};
use super::store::{Document, TransactionalStore, TxWrite};
use super::window::{
    evaluate_fixed, evaluate_sliding, fixed_window_start, FixedWindowRecord, RateLimitDecision,
    SlidingWindowRecord,
};
use crate::clock::{Clock, SystemClock};
use crate::metrics::{ABUSE_EVENTS_TOTAL, RATE_LIMIT_DECISIONS_TOTAL, RATE_LIMIT_STORE_ERRORS_TOTAL};
use crate::telemetry::{Telemetry, TracingTelemetry};

/// Metric name recorded for every policy denial
pub const ABUSE_METRIC: &str = "rate_limit_exceeded";

/// Result of `enforce_rate_limit`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Enforcement {
    /// Whether the request is admitted
    pub allowed: bool,

    /// Headers to copy onto the response (absent when no scope was evaluated)
    pub headers: Option<RateLimitHeaders>,

    /// Denial message
    pub error: Option<String>,

    /// First scope that denied the request
    pub denied_scope: Option<Scope>,

    /// A fail-open scope could not be checked and was admitted unchecked
    pub degraded: bool,
}

impl Enforcement {
    fn unrestricted() -> Self {
        Self {
            allowed: true,
            headers: None,
            error: None,
            denied_scope: None,
            degraded: false,
        }
    }
}

/// Rate limiter over a shared transactional store
#[derive(Clone)]
pub struct RateLimiter {
    config: Arc<RateLimitConfig>,
    store: Arc<dyn TransactionalStore>,
    clock: Arc<dyn Clock>,
    telemetry: Arc<dyn Telemetry>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("store", &"<dyn TransactionalStore>")
            .finish()
    }
}

fn decode<T: DeserializeOwned>(key: &str, doc: Option<&Document>) -> Result<Option<T>, StoreError> {
    doc.map(|d| serde_json::from_value(d.clone()))
        .transpose()
        .map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })
}

fn encode<T: Serialize>(key: &str, record: &T) -> Result<Document, StoreError> {
    serde_json::to_value(record).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

impl RateLimiter {
    /// Create a limiter using the system clock and tracing telemetry
    pub fn new(config: RateLimitConfig, store: Arc<dyn TransactionalStore>) -> Self {
        Self {
            config: Arc::new(config),
            store,
            clock: Arc::new(SystemClock),
            telemetry: Arc::new(TracingTelemetry),
        }
    }

    /// Replace the time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the telemetry sink
    pub fn with_telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Active configuration
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Backing store
    pub fn store(&self) -> &Arc<dyn TransactionalStore> {
        &self.store
    }

    /// Evaluate one scope of one endpoint
    ///
    /// With `skip_increment` the check is a dry-run probe that consumes
    /// nothing. Denial is reported through `allowed = false`; an `Err` always
    /// means the decision could not be made.
    pub async fn check_rate_limit(
        &self,
        endpoint: &str,
        identifier: &str,
        scope: Scope,
        skip_increment: bool,
    ) -> Result<RateLimitDecision, RateLimitError> {
        let now = self.clock.now_ms();
        let Some(policy) = self.config.policy_for(endpoint).scope(scope) else {
            return Ok(RateLimitDecision::unlimited(now));
        };

        let key = RateLimitKey::new(endpoint, scope, identifier);
        let decision = match policy.strategy {
            Strategy::SlidingWindow => self.check_sliding(&key, policy, now, skip_increment).await?,
            Strategy::FixedWindow => self.check_fixed(&key, policy, now, skip_increment).await?,
        };

        let outcome = match (decision.allowed, skip_increment) {
            (false, _) => "denied",
            (true, true) => "probe",
            (true, false) => "allowed",
        };
        RATE_LIMIT_DECISIONS_TOTAL
            .with_label_values(&[endpoint, scope.as_str(), outcome])
            .inc();
        tracing::debug!(
            key = %key,
            allowed = decision.allowed,
            remaining = decision.remaining,
            "Rate limit checked"
        );

        Ok(decision)
    }

    async fn check_sliding(
        &self,
        key: &RateLimitKey,
        policy: &ScopePolicy,
        now: i64,
        skip_increment: bool,
    ) -> Result<RateLimitDecision, RateLimitError> {
        let doc_key = key.to_string();
        let mut decision = None;

        self.store
            .run_transaction(&doc_key, &mut |doc| {
                let record = decode::<SlidingWindowRecord>(&doc_key, doc)?;
                let outcome =
                    evaluate_sliding(record, policy.limit, policy.window_ms, now, skip_increment);
                let write = match &outcome.write {
                    Some(record) => TxWrite::Put(encode(&doc_key, record)?),
                    None => TxWrite::Keep,
                };
                decision = Some(outcome.decision);
                Ok(write)
            })
            .await
            .map_err(|e| RateLimitError::store(doc_key.clone(), e))?;

        decision.ok_or_else(|| {
            RateLimitError::store(
                doc_key.clone(),
                StoreError::Unavailable("transaction committed without a decision".to_string()),
            )
        })
    }

    async fn check_fixed(
        &self,
        key: &RateLimitKey,
        policy: &ScopePolicy,
        now: i64,
        skip_increment: bool,
    ) -> Result<RateLimitDecision, RateLimitError> {
        let doc_key = key.bucket(fixed_window_start(now, policy.window_ms));
        let mut decision = None;

        self.store
            .run_transaction(&doc_key, &mut |doc| {
                let record = decode::<FixedWindowRecord>(&doc_key, doc)?;
                let outcome =
                    evaluate_fixed(record, policy.limit, policy.window_ms, now, skip_increment);
                let write = match &outcome.write {
                    Some(record) => TxWrite::Put(encode(&doc_key, record)?),
                    None => TxWrite::Keep,
                };
                decision = Some(outcome.decision);
                Ok(write)
            })
            .await
            .map_err(|e| RateLimitError::store(doc_key.clone(), e))?;

        decision.ok_or_else(|| {
            RateLimitError::store(
                doc_key.clone(),
                StoreError::Unavailable("transaction committed without a decision".to_string()),
            )
        })
    }

    /// Evaluate every configured scope of `endpoint` for one request
    ///
    /// Scopes run sequentially in the order user, IP, global. The first scope
    /// that denies decides the error and headers; later scopes are not
    /// checked. When all admit, the headers come from the scope with the
    /// fewest remaining requests. Store failures follow the endpoint's
    /// [`FailureMode`].
    pub async fn enforce_rate_limit(
        &self,
        endpoint: &str,
        user_id: Option<&str>,
        ip_address: Option<&str>,
        skip_increment: bool,
    ) -> Result<Enforcement, RateLimitError> {
        if !self.config.enabled {
            return Ok(Enforcement::unrestricted());
        }

        let policy = self.config.policy_for(endpoint);
        let mut admitted: Vec<RateLimitDecision> = Vec::new();
        let mut degraded = false;

        for scope in Scope::ALL {
            let Some(scope_policy) = policy.scope(scope) else {
                continue;
            };
            let identifier = match scope {
                Scope::User => user_id,
                Scope::Ip => ip_address,
                Scope::Global => Some(GLOBAL_IDENTIFIER),
            };
            let Some(identifier) = identifier else {
                continue;
            };

            match self
                .check_rate_limit(endpoint, identifier, scope, skip_increment)
                .await
            {
                Ok(decision) if decision.allowed => admitted.push(decision),
                Ok(decision) => {
                    self.report_denial(endpoint, scope, identifier, &decision);
                    return Ok(Enforcement {
                        allowed: false,
                        headers: Some(RateLimitHeaders::from_decision(&decision)),
                        error: Some(scope_policy.denial_message(scope)),
                        denied_scope: Some(scope),
                        degraded,
                    });
                }
                Err(err) => {
                    self.report_store_failure(endpoint, scope, policy, &err);
                    match policy.failure_mode {
                        FailureMode::FailClosed => return Err(err),
                        FailureMode::FailOpen => degraded = true,
                    }
                }
            }
        }

        let headers = admitted
            .iter()
            .min_by_key(|d| d.remaining)
            .map(RateLimitHeaders::from_decision);

        Ok(Enforcement {
            allowed: true,
            headers,
            error: None,
            denied_scope: None,
            degraded,
        })
    }

    fn report_denial(
        &self,
        endpoint: &str,
        scope: Scope,
        identifier: &str,
        decision: &RateLimitDecision,
    ) {
        ABUSE_EVENTS_TOTAL
            .with_label_values(&[endpoint, scope.as_str()])
            .inc();
        self.telemetry.record_metric(
            ABUSE_METRIC,
            1.0,
            "count",
            &[("endpoint", endpoint), ("scope", scope.as_str())],
        );
        tracing::warn!(
            endpoint,
            scope = %scope,
            identifier,
            limit = decision.limit,
            retry_after_ms = decision.retry_after_ms.unwrap_or(0),
            "Rate limit exceeded"
        );
    }

    fn report_store_failure(
        &self,
        endpoint: &str,
        scope: Scope,
        policy: &EndpointPolicy,
        err: &RateLimitError,
    ) {
        let mode = match policy.failure_mode {
            FailureMode::FailClosed => "fail_closed",
            FailureMode::FailOpen => "fail_open",
        };
        RATE_LIMIT_STORE_ERRORS_TOTAL
            .with_label_values(&[endpoint, mode])
            .inc();
        self.telemetry.log_error(
            "enforce_rate_limit",
            err,
            json!({
                "endpoint": endpoint,
                "scope": scope.as_str(),
                "key": err.key(),
                "failure_mode": mode,
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::rate_limit::config::ScopePolicy;
    use crate::rate_limit::store::MemoryStore;
    use crate::telemetry::MemoryTelemetry;
    use std::time::Duration;

    const T0: i64 = 1_700_000_000_000;

    struct Harness {
        limiter: RateLimiter,
        store: MemoryStore,
        clock: Arc<ManualClock>,
        telemetry: Arc<MemoryTelemetry>,
    }

    fn harness(endpoint: &str, policy: EndpointPolicy) -> Harness {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(T0));
        let telemetry = Arc::new(MemoryTelemetry::new());
        let limiter = RateLimiter::new(
            RateLimitConfig::single(endpoint, policy),
            Arc::new(store.clone()),
        )
        .with_clock(clock.clone())
        .with_telemetry(telemetry.clone());
        Harness {
            limiter,
            store,
            clock,
            telemetry,
        }
    }

    fn user_only(policy: ScopePolicy) -> EndpointPolicy {
        EndpointPolicy {
            per_user: Some(policy),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_sliding_window_scenario() {
        let h = harness("quiz", user_only(ScopePolicy::sliding(3, 60_000)));

        let mut remaining = Vec::new();
        for _ in 0..3 {
            let d = h
                .limiter
                .check_rate_limit("quiz", "u1", Scope::User, false)
                .await
                .unwrap();
            assert!(d.allowed);
            remaining.push(d.remaining);
            h.clock.advance(Duration::from_millis(300));
        }
        assert_eq!(remaining, vec![2, 1, 0]);

        h.clock.set(T0 + 1_000);
        let denied = h
            .limiter
            .check_rate_limit("quiz", "u1", Scope::User, false)
            .await
            .unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_ms, Some(59_000));
        assert_eq!(denied.reset_time_ms, T0 + 60_000);

        // Another user is unaffected
        let other = h
            .limiter
            .check_rate_limit("quiz", "u2", Scope::User, false)
            .await
            .unwrap();
        assert!(other.allowed);
    }

    #[tokio::test]
    async fn test_window_slides_open_again() {
        let h = harness("quiz", user_only(ScopePolicy::sliding(1, 10_000)));
        let limiter = &h.limiter;

        assert!(limiter.check_rate_limit("quiz", "u1", Scope::User, false).await.unwrap().allowed);
        h.clock.advance(Duration::from_millis(9_999));
        assert!(!limiter.check_rate_limit("quiz", "u1", Scope::User, false).await.unwrap().allowed);
        h.clock.advance(Duration::from_millis(2));
        assert!(limiter.check_rate_limit("quiz", "u1", Scope::User, false).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_skip_increment_consumes_nothing() {
        let h = harness("quiz", user_only(ScopePolicy::sliding(2, 60_000)));

        for _ in 0..5 {
            let probe = h
                .limiter
                .check_rate_limit("quiz", "u1", Scope::User, true)
                .await
                .unwrap();
            assert!(probe.allowed);
            assert_eq!(probe.remaining, 2);
        }
        assert_eq!(h.store.count().await, 0);
    }

    #[tokio::test]
    async fn test_fixed_window_bucket_boundary() {
        let h = harness("submit", user_only(ScopePolicy::fixed(2, 60_000)));
        // Align to a bucket start
        h.clock.set(fixed_window_start(T0, 60_000) + 59_000);

        for _ in 0..2 {
            assert!(h.limiter.check_rate_limit("submit", "u1", Scope::User, false).await.unwrap().allowed);
        }
        let denied = h
            .limiter
            .check_rate_limit("submit", "u1", Scope::User, false)
            .await
            .unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_ms, Some(1_000));

        // Next bucket starts from zero: up to 2x limit across the boundary
        h.clock.advance(Duration::from_millis(1_000));
        for _ in 0..2 {
            assert!(h.limiter.check_rate_limit("submit", "u1", Scope::User, false).await.unwrap().allowed);
        }
        assert_eq!(h.store.count().await, 2);
    }

    #[tokio::test]
    async fn test_unconfigured_scope_is_unlimited() {
        let h = harness("quiz", user_only(ScopePolicy::sliding(1, 1_000)));
        let d = h
            .limiter
            .check_rate_limit("quiz", "1.2.3.4", Scope::Ip, false)
            .await
            .unwrap();
        assert!(d.allowed);
        assert_eq!(d.remaining, u32::MAX);
    }

    #[tokio::test]
    async fn test_enforce_first_denying_scope_wins() {
        let policy = EndpointPolicy {
            per_user: Some(ScopePolicy::sliding(1, 60_000).with_message("user limit")),
            per_ip: Some(ScopePolicy::sliding(1, 60_000).with_message("ip limit")),
            global: None,
            failure_mode: FailureMode::FailClosed,
        };
        let h = harness("quiz", policy);

        let first = h
            .limiter
            .enforce_rate_limit("quiz", Some("u1"), Some("10.0.0.1"), false)
            .await
            .unwrap();
        assert!(first.allowed);

        let second = h
            .limiter
            .enforce_rate_limit("quiz", Some("u1"), Some("10.0.0.1"), false)
            .await
            .unwrap();
        assert!(!second.allowed);
        assert_eq!(second.denied_scope, Some(Scope::User));
        assert_eq!(second.error.as_deref(), Some("user limit"));

        let headers = second.headers.unwrap();
        assert_eq!(headers.remaining, 0);
        assert!(headers.retry_after.is_some());

        // Denial emitted the abuse metric
        let abuse = h.telemetry.metrics_named(ABUSE_METRIC);
        assert_eq!(abuse.len(), 1);
        assert_eq!(abuse[0].tag("scope"), Some("user"));
    }

    #[tokio::test]
    async fn test_enforce_skips_later_scopes_after_denial() {
        let policy = EndpointPolicy {
            per_user: Some(ScopePolicy::sliding(1, 60_000)),
            per_ip: Some(ScopePolicy::sliding(10, 60_000)),
            global: None,
            failure_mode: FailureMode::FailClosed,
        };
        let h = harness("quiz", policy);

        h.limiter
            .enforce_rate_limit("quiz", Some("u1"), Some("10.0.0.1"), false)
            .await
            .unwrap();
        h.limiter
            .enforce_rate_limit("quiz", Some("u1"), Some("10.0.0.1"), false)
            .await
            .unwrap();

        let ip_probe = h
            .limiter
            .check_rate_limit("quiz", "10.0.0.1", Scope::Ip, true)
            .await
            .unwrap();
        // Only the first (admitted) request reached the IP scope
        assert_eq!(ip_probe.remaining, 9);
    }

    #[tokio::test]
    async fn test_enforce_headers_show_most_restrictive_scope() {
        let policy = EndpointPolicy {
            per_user: Some(ScopePolicy::sliding(10, 60_000)),
            per_ip: Some(ScopePolicy::sliding(3, 60_000)),
            global: Some(ScopePolicy::fixed(100, 60_000)),
            failure_mode: FailureMode::FailClosed,
        };
        let h = harness("quiz", policy);

        let result = h
            .limiter
            .enforce_rate_limit("quiz", Some("u1"), Some("10.0.0.1"), false)
            .await
            .unwrap();
        assert!(result.allowed);
        let headers = result.headers.unwrap();
        assert_eq!(headers.limit, 3);
        assert_eq!(headers.remaining, 2);
        assert!(headers.retry_after.is_none());
    }

    #[tokio::test]
    async fn test_enforce_without_identity_uses_remaining_scopes() {
        let policy = EndpointPolicy {
            per_user: Some(ScopePolicy::sliding(1, 60_000)),
            per_ip: None,
            global: Some(ScopePolicy::sliding(5, 60_000)),
            failure_mode: FailureMode::FailClosed,
        };
        let h = harness("quiz", policy);

        for _ in 0..3 {
            let result = h
                .limiter
                .enforce_rate_limit("quiz", None, None, false)
                .await
                .unwrap();
            assert!(result.allowed);
        }
        assert_eq!(h.store.keys("quiz:global").await.unwrap().len(), 1);
        assert!(h.store.keys("quiz:user").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fail_closed_propagates_store_error() {
        let h = harness("quiz", user_only(ScopePolicy::sliding(5, 60_000)));
        h.store.set_available(false);

        let result = h
            .limiter
            .enforce_rate_limit("quiz", Some("u1"), None, false)
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.key(), "quiz:user:u1");

        let errors = h.telemetry.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].context["failure_mode"], "fail_closed");
        // Infrastructure failure is not an abuse event
        assert!(h.telemetry.metrics_named(ABUSE_METRIC).is_empty());
    }

    #[tokio::test]
    async fn test_fail_open_admits_degraded() {
        let mut policy = user_only(ScopePolicy::sliding(5, 60_000));
        policy.failure_mode = FailureMode::FailOpen;
        let h = harness("quiz", policy);
        h.store.set_available(false);

        let result = h
            .limiter
            .enforce_rate_limit("quiz", Some("u1"), None, false)
            .await
            .unwrap();
        assert!(result.allowed);
        assert!(result.degraded);
        assert!(result.headers.is_none());
        assert_eq!(h.telemetry.errors().len(), 1);
    }

    #[tokio::test]
    async fn test_check_rate_limit_surfaces_store_error() {
        let mut policy = user_only(ScopePolicy::fixed(5, 60_000));
        policy.failure_mode = FailureMode::FailOpen;
        let h = harness("quiz", policy);
        h.store.set_available(false);

        // The per-scope check never fails open on its own
        let result = h
            .limiter
            .check_rate_limit("quiz", "u1", Scope::User, false)
            .await;
        assert!(matches!(
            result,
            Err(RateLimitError::Store {
                source: StoreError::Unavailable(_),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_corrupt_record_is_infrastructure_error() {
        let h = harness("quiz", user_only(ScopePolicy::sliding(5, 60_000)));
        h.store
            .set("quiz:user:u1", json!({ "requests": "not-a-list" }))
            .await
            .unwrap();

        let result = h
            .limiter
            .check_rate_limit("quiz", "u1", Scope::User, false)
            .await;
        assert!(matches!(
            result,
            Err(RateLimitError::Store {
                source: StoreError::Corrupt { .. },
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_disabled_allows_all() {
        let store = MemoryStore::new();
        let limiter = RateLimiter::new(RateLimitConfig::disabled(), Arc::new(store.clone()));

        for _ in 0..200 {
            let result = limiter
                .enforce_rate_limit("generate_questions", Some("u1"), Some("1.1.1.1"), false)
                .await
                .unwrap();
            assert!(result.allowed);
        }
        assert_eq!(store.count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_endpoint_uses_default_policy() {
        let h = harness("quiz", user_only(ScopePolicy::sliding(1, 60_000)));
        let result = h
            .limiter
            .enforce_rate_limit("unlisted", Some("u1"), Some("10.0.0.1"), false)
            .await
            .unwrap();
        assert!(result.allowed);
        let headers = result.headers.unwrap();
        assert_eq!(headers.limit, crate::rate_limit::config::DEFAULT_USER_LIMIT);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_handlers_never_exceed_limit() {
        let store = MemoryStore::new();
        let limiter = RateLimiter::new(
            RateLimitConfig::single("quiz", user_only(ScopePolicy::sliding(5, 60_000))),
            Arc::new(store.clone()),
        );

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    limiter
                        .enforce_rate_limit("quiz", Some("u1"), None, false)
                        .await
                })
            })
            .collect();

        let admitted = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(Ok(e)) if e.allowed))
            .count();

        let stored = store.get("quiz:user:u1").await.unwrap().unwrap();
        let logged = stored["requests"].as_array().unwrap().len();
        assert!(admitted <= 5);
        assert_eq!(admitted, logged);
    }
}
