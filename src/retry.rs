//! Retry Logic and Deadlines
//!
//! Generic retry wrapper with geometric backoff, per-attempt timeouts and
//! cancellation, plus [`cascading_timeout`] for deriving a child deadline
//! from a parent one.
//!
//! # Features
//!
//! - **Geometric Backoff**: `delay = min(delay * backoff_factor, max_delay)`,
//!   starting at `initial_delay`
//! - **Per-attempt Timeout**: each attempt races a timer and fails with the
//!   distinguishable [`RetryError::Timeout`]
//! - **Retry Predicate**: only errors accepted by `should_retry` are retried;
//!   the default accepts timeouts, connection resets/timeouts and 429/5xx
//! - **Cancellation**: a [`CancellationToken`] interrupts backoff sleeps and
//!   drops the in-flight attempt
//!
//! # Example
//!
//! ```ignore
//! use quotaguard::retry::{with_retry, RetryOptions};
//!
//! let options = RetryOptions::new()
//!     .max_retries(3)
//!     .initial_delay(Duration::from_millis(500))
//!     .timeout(Duration::from_secs(10));
//!
//! let body = with_retry(&options, &cancel, |_attempt| async {
//!     fetch_data().await
//! }).await?;
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::metrics::RETRY_ATTEMPTS_TOTAL;

/// Floor used by [`cascading_timeout`] when the buffer swallows the parent
pub const MIN_CASCADE_TIMEOUT: Duration = Duration::from_secs(10);

/// Failure of a retried operation
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// An attempt exceeded the per-attempt timeout
    #[error("operation timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The caller abandoned the operation
    #[error("operation cancelled")]
    Cancelled,

    /// The operation itself failed
    #[error(transparent)]
    Operation(E),
}

impl<E> RetryError<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RetryError::Timeout(_))
    }

    /// The operation's own error, if that is what failed
    pub fn operation(&self) -> Option<&E> {
        match self {
            RetryError::Operation(e) => Some(e),
            _ => None,
        }
    }

    pub fn into_operation(self) -> Option<E> {
        match self {
            RetryError::Operation(e) => Some(e),
            _ => None,
        }
    }
}

/// Transport-level classification used by the default retry predicate
pub trait Classify {
    /// HTTP-like status carried by the failure
    fn status_code(&self) -> Option<u16>;

    /// Human-readable description searched for transport failure markers
    fn description(&self) -> String;
}

impl Classify for anyhow::Error {
    fn status_code(&self) -> Option<u16> {
        self.downcast_ref::<reqwest::Error>()
            .and_then(|e| e.status())
            .map(|s| s.as_u16())
    }

    fn description(&self) -> String {
        format!("{:#}", self)
    }
}

impl Classify for std::io::Error {
    fn status_code(&self) -> Option<u16> {
        None
    }

    fn description(&self) -> String {
        match self.kind() {
            std::io::ErrorKind::ConnectionReset => "connection reset".to_string(),
            std::io::ErrorKind::TimedOut => "connection timed out".to_string(),
            _ => self.to_string(),
        }
    }
}

/// Predicate deciding whether a failed attempt is retried
pub type RetryPredicate<E> = Arc<dyn Fn(&RetryError<E>) -> bool + Send + Sync>;

/// Retry configuration
///
/// `max_retries` counts retries after the first attempt, so an operation
/// runs at most `max_retries + 1` times.
pub struct RetryOptions<E> {
    /// Retries after the first attempt (default: 3)
    pub max_retries: u32,

    /// Delay before the first retry (default: 1s)
    pub initial_delay: Duration,

    /// Cap on the delay between attempts (default: 30s)
    pub max_delay: Duration,

    /// Delay multiplier per retry (default: 2.0)
    pub backoff_factor: f64,

    /// Per-attempt timeout (default: none)
    pub timeout: Option<Duration>,

    /// Random delay variation factor, 0.0 to 1.0 (default: 0.0)
    pub jitter: f64,

    should_retry: Option<RetryPredicate<E>>,
}

impl<E> Clone for RetryOptions<E> {
    fn clone(&self) -> Self {
        Self {
            max_retries: self.max_retries,
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
            backoff_factor: self.backoff_factor,
            timeout: self.timeout,
            jitter: self.jitter,
            should_retry: self.should_retry.clone(),
        }
    }
}

impl<E> fmt::Debug for RetryOptions<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("max_retries", &self.max_retries)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_factor", &self.backoff_factor)
            .field("timeout", &self.timeout)
            .field("jitter", &self.jitter)
            .field("custom_predicate", &self.should_retry.is_some())
            .finish()
    }
}

impl<E> Default for RetryOptions<E> {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            timeout: None,
            jitter: 0.0,
            should_retry: None,
        }
    }
}

impl<E> RetryOptions<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the backoff multiplier (values below 1.0 are raised to 1.0)
    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = if factor.is_finite() { factor.max(1.0) } else { 1.0 };
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the jitter factor
    ///
    /// Jitter adds random variation to delays so clients that failed together
    /// do not retry together.
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Replace the default retry predicate
    pub fn should_retry<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&RetryError<E>) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    /// Delay before retry number `retry` (1-based), without jitter
    pub fn delay_for(&self, retry: u32) -> Duration {
        let mut delay = self.initial_delay.min(self.max_delay);
        for _ in 1..retry {
            delay = self.next_delay(delay);
        }
        delay
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::try_from_secs_f64(delay.as_secs_f64() * self.backoff_factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter == 0.0 {
            return delay;
        }
        let spread = delay.as_secs_f64() * self.jitter;
        let offset = (rand::random::<f64>() - 0.5) * 2.0 * spread;
        Duration::try_from_secs_f64((delay.as_secs_f64() + offset).max(0.0))
            .unwrap_or(delay)
            .min(self.max_delay)
    }
}

impl<E: Classify> RetryOptions<E> {
    fn accepts(&self, err: &RetryError<E>) -> bool {
        match &self.should_retry {
            Some(predicate) => predicate(err),
            None => default_should_retry(err),
        }
    }
}

/// Check if an HTTP status code should be retried
///
/// Retryable status codes:
/// - 408 Request Timeout
/// - 429 Too Many Requests
/// - 5xx Server Error (except 501 Not Implemented, 505 HTTP Version Not Supported)
pub fn should_retry_status(status: u16) -> bool {
    match status {
        408 | 429 => true,
        500..=599 => status != 501 && status != 505,
        _ => false,
    }
}

/// Default retry predicate
///
/// Retries timeouts, connection resets, connection timeouts and retryable
/// HTTP statuses. Cancellation is never retried.
pub fn default_should_retry<E: Classify>(err: &RetryError<E>) -> bool {
    match err {
        RetryError::Timeout(_) => true,
        RetryError::Cancelled => false,
        RetryError::Operation(e) => {
            if let Some(status) = e.status_code() {
                return should_retry_status(status);
            }
            let description = e.description().to_lowercase();
            description.contains("timeout")
                || description.contains("timed out")
                || description.contains("connection reset")
                || description.contains("econnreset")
                || description.contains("etimedout")
        }
    }
}

async fn run_attempt<T, E, Fut>(fut: Fut, timeout: Option<Duration>) -> Result<T, RetryError<E>>
where
    Fut: Future<Output = Result<T, E>>,
{
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result.map_err(RetryError::Operation),
            Err(_) => Err(RetryError::Timeout(limit)),
        },
        None => fut.await.map_err(RetryError::Operation),
    }
}

/// Retry an operation with geometric backoff
///
/// `operation` receives the 1-based attempt number. Errors rejected by the
/// retry predicate, and the error of the final attempt, are returned as-is.
/// Cancelling `cancel` drops the attempt in flight and stops any pending
/// backoff sleep.
pub async fn with_retry<T, E, F, Fut>(
    options: &RetryOptions<E>,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + fmt::Display,
{
    let max_attempts = options.max_retries.saturating_add(1);
    let mut delay = options.initial_delay.min(options.max_delay);
    let mut attempt = 1;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RetryError::Cancelled),
            result = run_attempt(operation(attempt), options.timeout) => result,
        };

        let err = match result {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(attempt, "Operation succeeded after {} retries", attempt - 1);
                }
                RETRY_ATTEMPTS_TOTAL.with_label_values(&["success"]).inc();
                return Ok(value);
            }
            Err(RetryError::Cancelled) => {
                RETRY_ATTEMPTS_TOTAL.with_label_values(&["cancelled"]).inc();
                return Err(RetryError::Cancelled);
            }
            Err(err) => err,
        };

        if attempt >= max_attempts || !options.accepts(&err) {
            RETRY_ATTEMPTS_TOTAL.with_label_values(&["failure"]).inc();
            tracing::debug!(attempt, error = %err, "Operation failed, not retrying");
            return Err(err);
        }

        let wait = options.jittered(delay);
        RETRY_ATTEMPTS_TOTAL.with_label_values(&["retry"]).inc();
        tracing::warn!(
            attempt,
            delay_ms = wait.as_millis() as u64,
            error = %err,
            "Attempt failed, retrying after delay"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = sleep(wait) => {}
        }

        delay = options.next_delay(delay);
        attempt += 1;
    }
}

/// Timeout for a child operation that must finish inside `parent`
///
/// Returns `parent - buffer` when the buffer is non-zero and smaller than the
/// parent. Otherwise falls back to
/// `max(10s, parent / 2)`, or to `parent / 2` when the 10 s floor would not
/// fit inside the parent. The result is strictly below `parent` for any
/// non-zero parent.
pub fn cascading_timeout(parent: Duration, buffer: Duration) -> Duration {
    if !buffer.is_zero() && buffer < parent {
        return parent - buffer;
    }
    let fallback = MIN_CASCADE_TIMEOUT.max(parent / 2);
    if fallback < parent {
        fallback
    } else {
        parent / 2
    }
}
