//! Quota State
//!
//! Process-local usage counters for the upstream provider. Nothing runs on a
//! timer: minute and day counters, and the provider-imposed cool-down, expire
//! lazily the first time the state is inspected after their deadline.
//!
//! The state is not shared between processes, so with several replicas each
//! one enforces its own copy of the budget.

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::{ceil_secs, QuotaError, QuotaWindow};

pub const MINUTE_MS: i64 = 60_000;
pub const DAY_MS: i64 = 86_400_000;

/// Budget and backoff settings for the governor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Successful calls allowed per minute
    pub requests_per_minute: u32,

    /// Successful calls allowed per day
    pub requests_per_day: u32,

    /// Minimum self-throttle before a call that follows a quota error
    pub min_interval_ms: u64,

    /// Backoff unit, scaled by the number of consecutive quota errors
    pub backoff_base_ms: u64,

    /// Cap on any single governor wait
    pub max_backoff_ms: u64,

    /// Cool-down applied when the provider gives no retry hint
    pub default_cooldown_ms: u64,

    /// Attempts per generation, including the first
    pub max_retries: u32,

    /// Timeout for one provider call (0 = none)
    pub call_timeout_ms: u64,

    /// Extra attempts after a call times out without any response
    pub timeout_retries: u32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 15,
            requests_per_day: 1500,
            min_interval_ms: 4_000,
            backoff_base_ms: 2_000,
            max_backoff_ms: 30_000,
            default_cooldown_ms: 60_000,
            max_retries: 3,
            call_timeout_ms: 60_000,
            timeout_retries: 1,
        }
    }
}

impl QuotaConfig {
    pub fn default_cooldown(&self) -> Duration {
        Duration::from_millis(self.default_cooldown_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        (self.call_timeout_ms > 0).then(|| Duration::from_millis(self.call_timeout_ms))
    }

    /// Self-throttle applied before a call when earlier calls hit quota errors
    ///
    /// `max(min_interval, consecutive_errors * backoff_base)`, capped at
    /// `max_backoff`; zero when there were no errors.
    pub fn throttle_delay(&self, consecutive_errors: u32) -> Duration {
        if consecutive_errors == 0 {
            return Duration::ZERO;
        }
        let scaled = self
            .backoff_base_ms
            .saturating_mul(consecutive_errors as u64);
        Duration::from_millis(scaled.max(self.min_interval_ms).min(self.max_backoff_ms))
    }

    /// Wait after a quota error on `attempt` (1-based) before trying again
    ///
    /// Long enough to outlast the cool-down when possible, never shorter than
    /// the attempt-scaled backoff, never longer than `max_backoff`.
    pub fn retry_backoff(&self, attempt: u32, cooldown_remaining: Duration) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let scaled = Duration::from_millis(self.backoff_base_ms.saturating_mul(1u64 << exponent));
        (cooldown_remaining + Duration::from_millis(1))
            .max(scaled)
            .min(self.max_backoff())
    }

    pub fn validate(&self) -> Result<()> {
        if self.requests_per_minute == 0 || self.requests_per_day == 0 {
            anyhow::bail!("Quota limits must be > 0");
        }
        if self.max_retries == 0 {
            anyhow::bail!("quota.max_retries must be at least 1");
        }
        if self.max_backoff_ms < self.backoff_base_ms {
            anyhow::bail!(
                "quota.max_backoff_ms ({}) must be >= quota.backoff_base_ms ({})",
                self.max_backoff_ms,
                self.backoff_base_ms
            );
        }
        Ok(())
    }
}

/// Usage counters and cool-down for one process
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QuotaState {
    pub requests_this_minute: u32,
    pub requests_today: u32,
    pub last_minute_reset: i64,
    pub last_day_reset: i64,
    pub consecutive_errors: u32,
    pub is_rate_limited: bool,
    pub rate_limited_until: i64,
    /// Admitted calls that have not finished yet; they hold budget in both windows
    pub in_flight: u32,
}

fn ms(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

fn until(deadline_ms: i64, now_ms: i64) -> Duration {
    Duration::from_millis((deadline_ms - now_ms).max(0) as u64)
}

impl QuotaState {
    /// Zeroed state with both windows starting at `now_ms`
    pub fn new(now_ms: i64) -> Self {
        Self {
            last_minute_reset: now_ms,
            last_day_reset: now_ms,
            ..Self::default()
        }
    }

    /// Apply every expiry whose deadline has passed
    pub fn refresh(&mut self, now_ms: i64) {
        if now_ms - self.last_minute_reset >= MINUTE_MS {
            self.requests_this_minute = 0;
            self.last_minute_reset = now_ms;
        }
        if now_ms - self.last_day_reset >= DAY_MS {
            self.requests_today = 0;
            self.last_day_reset = now_ms;
        }
        if self.is_rate_limited && now_ms > self.rate_limited_until {
            self.is_rate_limited = false;
            self.rate_limited_until = 0;
        }
    }

    /// Local admission check before any network call
    pub fn check_admission(&mut self, config: &QuotaConfig, now_ms: i64) -> Result<(), QuotaError> {
        self.refresh(now_ms);

        if self.is_rate_limited {
            return Err(QuotaError::RateLimited {
                retry_after: self.cooldown_remaining(now_ms),
            });
        }
        if self.requests_today.saturating_add(self.in_flight) >= config.requests_per_day {
            return Err(QuotaError::WouldExceed {
                window: QuotaWindow::Day,
                used: self.requests_today.saturating_add(self.in_flight),
                limit: config.requests_per_day,
                resets_in: until(self.last_day_reset + DAY_MS, now_ms),
            });
        }
        if self.requests_this_minute.saturating_add(self.in_flight) >= config.requests_per_minute {
            return Err(QuotaError::WouldExceed {
                window: QuotaWindow::Minute,
                used: self.requests_this_minute.saturating_add(self.in_flight),
                limit: config.requests_per_minute,
                resets_in: until(self.last_minute_reset + MINUTE_MS, now_ms),
            });
        }
        Ok(())
    }

    /// Admit one call and hold its slot until [`record_success`](Self::record_success)
    /// or [`release`](Self::release)
    pub fn reserve(&mut self, config: &QuotaConfig, now_ms: i64) -> Result<(), QuotaError> {
        self.check_admission(config, now_ms)?;
        self.in_flight += 1;
        Ok(())
    }

    /// Return a reserved slot without counting a call
    pub fn release(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    /// Count a completed call, consuming its reservation if one is held
    pub fn record_success(&mut self, now_ms: i64) {
        self.refresh(now_ms);
        self.release();
        self.requests_this_minute += 1;
        self.requests_today += 1;
        self.consecutive_errors = 0;
    }

    /// Enter a cool-down of `cooldown` after a provider quota error
    pub fn record_quota_error(&mut self, now_ms: i64, cooldown: Duration) {
        self.refresh(now_ms);
        self.is_rate_limited = true;
        self.rate_limited_until = now_ms.saturating_add(ms(cooldown));
        self.consecutive_errors += 1;
    }

    /// Time left in the cool-down (zero when none is active)
    pub fn cooldown_remaining(&self, now_ms: i64) -> Duration {
        if self.is_rate_limited {
            until(self.rate_limited_until, now_ms)
        } else {
            Duration::ZERO
        }
    }

    /// Diagnostic snapshot
    pub fn status(&self, config: &QuotaConfig, now_ms: i64) -> QuotaStatus {
        QuotaStatus {
            requests_this_minute: self.requests_this_minute,
            requests_per_minute_limit: config.requests_per_minute,
            requests_today: self.requests_today,
            requests_per_day_limit: config.requests_per_day,
            consecutive_errors: self.consecutive_errors,
            requests_in_flight: self.in_flight,
            is_rate_limited: self.is_rate_limited,
            rate_limited_until: self
                .is_rate_limited
                .then(|| Utc.timestamp_millis_opt(self.rate_limited_until).single())
                .flatten(),
            cooldown_remaining_secs: ceil_secs(&self.cooldown_remaining(now_ms)),
            minute_resets_in_secs: ceil_secs(&until(self.last_minute_reset + MINUTE_MS, now_ms)),
            day_resets_in_secs: ceil_secs(&until(self.last_day_reset + DAY_MS, now_ms)),
        }
    }
}

/// Quota snapshot served to health checks and the CLI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaStatus {
    pub requests_this_minute: u32,
    pub requests_per_minute_limit: u32,
    pub requests_today: u32,
    pub requests_per_day_limit: u32,
    pub consecutive_errors: u32,
    pub requests_in_flight: u32,
    pub is_rate_limited: bool,
    pub rate_limited_until: Option<DateTime<Utc>>,
    pub cooldown_remaining_secs: u64,
    pub minute_resets_in_secs: u64,
    pub day_resets_in_secs: u64,
}
