//! Quota Governor
//!
//! Sole gateway to the quota-limited upstream provider. Each attempt runs:
//!
//! 1. local admission against [`QuotaState`], reserving one slot of the
//!    minute and day budgets (fails fast, no network call)
//! 2. a self-throttle wait when earlier calls hit quota errors
//! 3. the provider call, wrapped in [`with_retry`] for the per-call timeout
//! 4. bookkeeping: a success keeps its slot, every failure returns it; quota
//!    errors start a cool-down and are retried with backoff, any other error
//!    is returned immediately
//!
//! The state lock is never held across an await, so a [`Reservation`]
//! dropped mid-call (caller gone, future cancelled) still returns its slot.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::error::QuotaError;
use super::provider::{GenerationProvider, ProviderError};
use super::state::{QuotaConfig, QuotaState, QuotaStatus};
use crate::clock::{Clock, SystemClock};
use crate::metrics::{QUOTA_COOLDOWN_ACTIVE, QUOTA_REQUESTS_TODAY, QUOTA_UPSTREAM_CALLS_TOTAL};
use crate::retry::{with_retry, RetryError, RetryOptions};
use crate::telemetry::{Telemetry, TracingTelemetry};

/// Gate in front of a [`GenerationProvider`]
pub struct QuotaGovernor {
    provider: Arc<dyn GenerationProvider>,
    config: QuotaConfig,
    state: Mutex<QuotaState>,
    clock: Arc<dyn Clock>,
    telemetry: Arc<dyn Telemetry>,
    call_options: RetryOptions<ProviderError>,
}

impl std::fmt::Debug for QuotaGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaGovernor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn call_options(config: &QuotaConfig) -> RetryOptions<ProviderError> {
    // Provider errors are classified by the governor; only silent timeouts
    // are retried here.
    let options = RetryOptions::new()
        .max_retries(config.timeout_retries)
        .initial_delay(Duration::from_millis(config.backoff_base_ms))
        .max_delay(config.max_backoff())
        .should_retry(|err: &RetryError<ProviderError>| err.is_timeout());
    match config.call_timeout() {
        Some(timeout) => options.timeout(timeout),
        None => options,
    }
}

/// Budget slot held by one in-flight provider call
struct Reservation<'a> {
    governor: &'a QuotaGovernor,
    active: bool,
}

impl Reservation<'_> {
    /// Count the call as a success
    fn commit(mut self) {
        let mut state = self.governor.lock_state();
        state.record_success(self.governor.clock.now_ms());
        self.governor.publish(&state);
        self.active = false;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.active {
            self.governor.lock_state().release();
        }
    }
}

impl QuotaGovernor {
    /// Create a governor using the system clock and tracing telemetry
    pub fn new(provider: Arc<dyn GenerationProvider>, config: QuotaConfig) -> Self {
        Self::with_clock(provider, config, Arc::new(SystemClock))
    }

    /// Create a governor with an explicit time source
    pub fn with_clock(
        provider: Arc<dyn GenerationProvider>,
        config: QuotaConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let state = QuotaState::new(clock.now_ms());
        Self {
            provider,
            call_options: call_options(&config),
            config,
            state: Mutex::new(state),
            clock,
            telemetry: Arc::new(TracingTelemetry),
        }
    }

    /// Replace the telemetry sink
    pub fn with_telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    /// Generate with the configured attempt budget and no cancellation
    pub async fn generate(&self, prompt: &str) -> Result<String, QuotaError> {
        self.generate_with_quota_management(prompt, self.config.max_retries, &CancellationToken::new())
            .await
    }

    /// Call the provider under quota management
    ///
    /// `max_retries` is the total number of attempts (at least one).
    pub async fn generate_with_quota_management(
        &self,
        prompt: &str,
        max_retries: u32,
        cancel: &CancellationToken,
    ) -> Result<String, QuotaError> {
        let attempts = max_retries.max(1);

        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(QuotaError::Cancelled);
            }

            let throttle = {
                let mut state = self.lock_state();
                let now = self.clock.now_ms();
                if let Err(err) = state.reserve(&self.config, now) {
                    self.publish(&state);
                    tracing::info!(attempt, code = err.code(), "Upstream call refused locally");
                    return Err(err);
                }
                self.config.throttle_delay(state.consecutive_errors)
            };
            let reservation = Reservation {
                governor: self,
                active: true,
            };
            if !throttle.is_zero() {
                tracing::debug!(delay_ms = throttle.as_millis() as u64, "Throttling before upstream call");
                self.pause(throttle, cancel).await?;
            }

            let result = with_retry(&self.call_options, cancel, |_| self.provider.generate(prompt)).await;

            let err = match result {
                Ok(text) => {
                    reservation.commit();
                    QUOTA_UPSTREAM_CALLS_TOTAL.with_label_values(&["success"]).inc();
                    return Ok(text);
                }
                Err(err) => {
                    drop(reservation);
                    err
                }
            };

            let err = match err {
                RetryError::Cancelled => return Err(QuotaError::Cancelled),
                RetryError::Timeout(after) => {
                    QUOTA_UPSTREAM_CALLS_TOTAL.with_label_values(&["timeout"]).inc();
                    return Err(QuotaError::Provider(ProviderError::timeout(after)));
                }
                RetryError::Operation(err) => err,
            };

            if !err.is_quota_error() {
                QUOTA_UPSTREAM_CALLS_TOTAL.with_label_values(&["error"]).inc();
                tracing::warn!(attempt, status = ?err.status, error = %err, "Upstream call failed");
                return Err(QuotaError::Provider(err));
            }

            QUOTA_UPSTREAM_CALLS_TOTAL.with_label_values(&["quota_error"]).inc();
            let cooldown = err.retry_delay.unwrap_or_else(|| self.config.default_cooldown());
            let remaining = {
                let mut state = self.lock_state();
                let now = self.clock.now_ms();
                state.record_quota_error(now, cooldown);
                self.publish(&state);
                state.cooldown_remaining(now)
            };
            self.telemetry.record_metric(
                "upstream_quota_error",
                1.0,
                "count",
                &[("attempt", attempt.to_string().as_str())],
            );

            if attempt == attempts {
                tracing::warn!(attempts, error = %err, "Upstream quota exhausted");
                return Err(QuotaError::ExhaustedAfterRetries { attempts, last: err });
            }

            if remaining >= self.config.max_backoff() {
                // The cool-down outlasts any wait this call may take
                tracing::warn!(
                    attempt,
                    cooldown_ms = remaining.as_millis() as u64,
                    "Upstream cool-down exceeds backoff cap, giving up"
                );
                return Err(QuotaError::RateLimited {
                    retry_after: remaining,
                });
            }

            let backoff = self.config.retry_backoff(attempt, remaining);
            tracing::warn!(
                attempt,
                cooldown_ms = cooldown.as_millis() as u64,
                backoff_ms = backoff.as_millis() as u64,
                "Upstream quota error, backing off"
            );
            self.pause(backoff, cancel).await?;
        }

        // `attempts >= 1`, so the loop always returns
        Err(QuotaError::Cancelled)
    }

    /// Current usage snapshot (applies pending expiries)
    pub async fn quota_status(&self) -> QuotaStatus {
        let mut state = self.lock_state();
        let now = self.clock.now_ms();
        state.refresh(now);
        self.publish(&state);
        state.status(&self.config, now)
    }

    async fn pause(&self, wait: Duration, cancel: &CancellationToken) -> Result<(), QuotaError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(QuotaError::Cancelled),
            _ = self.clock.sleep(wait) => Ok(()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, QuotaState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, state: &QuotaState) {
        QUOTA_REQUESTS_TODAY.set(state.requests_today as i64);
        QUOTA_COOLDOWN_ACTIVE.set(state.is_rate_limited as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::telemetry::MemoryTelemetry;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    const T0: i64 = 1_700_000_000_000;

    /// Provider that replays scripted outcomes, then succeeds
    struct ScriptedProvider {
        script: std::sync::Mutex<VecDeque<Result<String, ProviderError>>>,
        calls: AtomicU32,
    }

    impl ScriptedProvider {
        fn new(script: Vec<Result<String, ProviderError>>) -> Arc<Self> {
            Arc::new(Self {
                script: std::sync::Mutex::new(script.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GenerationProvider for ScriptedProvider {
        async fn generate(&self, prompt: &str) -> Result<String, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(format!("answer to {}", prompt)))
        }
    }

    fn governor(
        provider: Arc<ScriptedProvider>,
        config: QuotaConfig,
    ) -> (QuotaGovernor, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(T0));
        let governor = QuotaGovernor::with_clock(provider, config, clock.clone());
        (governor, clock)
    }

    fn quota_message(seconds: u64) -> ProviderError {
        ProviderError::from_message(format!(
            r#"[429 Too Many Requests] You exceeded your current quota. [{{"@type":"type.googleapis.com/google.rpc.RetryInfo","retryDelay":"{}s"}}]"#,
            seconds
        ))
    }

    #[tokio::test]
    async fn test_success_counts_usage() {
        let provider = ScriptedProvider::new(vec![]);
        let (governor, _) = governor(provider.clone(), QuotaConfig::default());

        assert_eq!(governor.generate("q1").await.unwrap(), "answer to q1");
        governor.generate("q2").await.unwrap();

        let status = governor.quota_status().await;
        assert_eq!(status.requests_this_minute, 2);
        assert_eq!(status.requests_today, 2);
        assert_eq!(status.consecutive_errors, 0);
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_day_limit_refuses_without_network_call() {
        let provider = ScriptedProvider::new(vec![]);
        let config = QuotaConfig {
            requests_per_day: 2,
            ..Default::default()
        };
        let (governor, _) = governor(provider.clone(), config);

        governor.generate("a").await.unwrap();
        governor.generate("b").await.unwrap();
        let err = governor.generate("c").await.unwrap_err();

        assert_eq!(err.code(), "QUOTA_WOULD_EXCEED");
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_retry_delay_hint_sets_cooldown() {
        let provider = ScriptedProvider::new(vec![Err(quota_message(30))]);
        let (governor, clock) = governor(provider.clone(), QuotaConfig::default());

        let err = governor
            .generate_with_quota_management("q", 1, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "QUOTA_EXHAUSTED_AFTER_RETRIES");

        let state = governor.lock_state().clone();
        assert!(state.is_rate_limited);
        let cooldown = state.rate_limited_until - T0;
        assert!((30_000..=30_001).contains(&cooldown), "cooldown {}", cooldown);

        clock.set(state.rate_limited_until - 1);
        let err = governor.generate("q").await.unwrap_err();
        assert_eq!(err.code(), "RATE_LIMITED");
        assert_eq!(provider.calls(), 1);

        clock.set(state.rate_limited_until + 1);
        assert!(governor.generate("q").await.is_ok());
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_non_quota_error_is_not_retried() {
        let provider = ScriptedProvider::new(vec![Err(ProviderError::new(
            Some(400),
            "Invalid argument: prompt is empty",
        ))]);
        let (governor, _) = governor(provider.clone(), QuotaConfig::default());

        let err = governor
            .generate_with_quota_management("", 3, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, QuotaError::Provider(ref e) if e.status == Some(400)));
        assert_eq!(provider.calls(), 1);
        assert_eq!(governor.quota_status().await.consecutive_errors, 0);
    }

    #[tokio::test]
    async fn test_quota_errors_exhaust_retries() {
        let provider = ScriptedProvider::new(vec![
            Err(quota_message(1)),
            Err(quota_message(1)),
            Err(quota_message(1)),
        ]);
        let telemetry = Arc::new(MemoryTelemetry::new());
        let (governor, clock) = governor(provider.clone(), QuotaConfig::default());
        let governor = governor.with_telemetry(telemetry.clone());

        let err = governor
            .generate_with_quota_management("q", 3, &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            QuotaError::ExhaustedAfterRetries { attempts, ref last } => {
                assert_eq!(attempts, 3);
                assert_eq!(last.status, Some(429));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(provider.calls(), 3);
        assert_eq!(telemetry.metrics_named("upstream_quota_error").len(), 3);
        // Backoffs and throttles were slept on the manual clock
        assert!(clock.now_ms() > T0 + 10_000);
    }

    #[tokio::test]
    async fn test_recovers_after_quota_error() {
        let provider = ScriptedProvider::new(vec![Err(quota_message(1))]);
        let (governor, clock) = governor(provider.clone(), QuotaConfig::default());

        let text = governor.generate("q").await.unwrap();
        assert_eq!(text, "answer to q");
        assert_eq!(provider.calls(), 2);

        let status = governor.quota_status().await;
        assert_eq!(status.consecutive_errors, 0);
        assert!(!status.is_rate_limited);
        assert_eq!(status.requests_today, 1);
        // backoff (2s) + throttle (4s)
        assert_eq!(clock.now_ms(), T0 + 6_000);
    }

    #[tokio::test]
    async fn test_long_cooldown_surfaces_rate_limited() {
        let provider = ScriptedProvider::new(vec![Err(ProviderError::quota(None))]);
        let (governor, clock) = governor(provider.clone(), QuotaConfig::default());

        // Default 60s cool-down outlasts the 30s backoff cap
        let err = governor.generate("q").await.unwrap_err();
        assert_eq!(err.code(), "RATE_LIMITED");
        assert_eq!(err.retry_after(), Some(Duration::from_secs(60)));
        assert_eq!(provider.calls(), 1);
        // Returned without sleeping
        assert_eq!(clock.now_ms(), T0);
        assert_eq!(governor.quota_status().await.requests_in_flight, 0);
    }

    #[tokio::test]
    async fn test_cooldown_at_backoff_cap_returns_immediately() {
        let provider = ScriptedProvider::new(vec![Err(quota_message(30))]);
        let (governor, clock) = governor(provider.clone(), QuotaConfig::default());

        let err = governor.generate("q").await.unwrap_err();
        assert_eq!(err.code(), "RATE_LIMITED");
        assert!(err.retry_after() >= Some(Duration::from_secs(30)));
        assert_eq!(provider.calls(), 1);
        assert_eq!(clock.now_ms(), T0);
    }

    /// Provider that takes real time to answer
    struct SlowProvider {
        calls: AtomicU32,
    }

    #[async_trait]
    impl GenerationProvider for SlowProvider {
        async fn generate(&self, prompt: &str) -> Result<String, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(format!("answer to {}", prompt))
        }
    }

    #[tokio::test]
    async fn test_concurrent_calls_respect_day_limit() {
        let provider = Arc::new(SlowProvider {
            calls: AtomicU32::new(0),
        });
        let config = QuotaConfig {
            requests_per_day: 2,
            ..Default::default()
        };
        let clock = Arc::new(ManualClock::new(T0));
        let governor = Arc::new(QuotaGovernor::with_clock(provider.clone(), config, clock));

        let handles: Vec<_> = (0..5)
            .map(|i| {
                let governor = governor.clone();
                tokio::spawn(async move { governor.generate(&format!("q{i}")).await })
            })
            .collect();
        let results = futures::future::join_all(handles).await;

        let mut successes = 0;
        for result in results {
            match result.unwrap() {
                Ok(_) => successes += 1,
                Err(err) => assert_eq!(err.code(), "QUOTA_WOULD_EXCEED"),
            }
        }
        assert_eq!(successes, 2);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);

        let status = governor.quota_status().await;
        assert_eq!(status.requests_today, 2);
        assert_eq!(status.requests_in_flight, 0);
    }

    #[tokio::test]
    async fn test_abandoned_call_returns_its_slot() {
        let provider = Arc::new(SlowProvider {
            calls: AtomicU32::new(0),
        });
        let config = QuotaConfig {
            requests_per_day: 1,
            ..Default::default()
        };
        let clock = Arc::new(ManualClock::new(T0));
        let governor = QuotaGovernor::with_clock(provider.clone(), config, clock);

        let abandoned = tokio::time::timeout(Duration::from_millis(10), governor.generate("a")).await;
        assert!(abandoned.is_err());
        let status = governor.quota_status().await;
        assert_eq!(status.requests_in_flight, 0);
        assert_eq!(status.requests_today, 0);

        assert!(governor.generate("b").await.is_ok());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_call() {
        let provider = ScriptedProvider::new(vec![]);
        let (governor, _) = governor(provider.clone(), QuotaConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = governor
            .generate_with_quota_management("q", 3, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CANCELLED");
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_quota_status_applies_lazy_expiry() {
        let provider = ScriptedProvider::new(vec![Err(quota_message(5))]);
        let (governor, clock) = governor(provider, QuotaConfig::default());

        let _ = governor
            .generate_with_quota_management("q", 1, &CancellationToken::new())
            .await;
        assert!(governor.quota_status().await.is_rate_limited);

        clock.advance(Duration::from_millis(5_001));
        let status = governor.quota_status().await;
        assert!(!status.is_rate_limited);
        assert_eq!(status.cooldown_remaining_secs, 0);
    }
}
