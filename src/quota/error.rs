//! Quota governor errors
//!
//! Every variant maps to a stable code so callers (and HTTP clients) can
//! branch on the failure class without parsing messages.

use serde::Serialize;
use std::fmt;
use std::time::Duration;

use super::provider::ProviderError;

/// Local budget window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaWindow {
    Minute,
    Day,
}

impl fmt::Display for QuotaWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaWindow::Minute => write!(f, "per-minute"),
            QuotaWindow::Day => write!(f, "daily"),
        }
    }
}

pub(crate) fn ceil_secs(d: &Duration) -> u64 {
    d.as_millis().div_ceil(1000) as u64
}

/// Errors surfaced by [`QuotaGovernor`](super::QuotaGovernor)
#[derive(Debug, Clone, thiserror::Error)]
pub enum QuotaError {
    /// The provider put this process in a cool-down that has not expired
    #[error("Upstream provider rate limit active; retry in {}s", ceil_secs(.retry_after))]
    RateLimited { retry_after: Duration },

    /// The local budget is spent; no call was made
    #[error("Request would exceed the {window} quota ({used}/{limit}); resets in {}s", ceil_secs(.resets_in))]
    WouldExceed {
        window: QuotaWindow,
        used: u32,
        limit: u32,
        resets_in: Duration,
    },

    /// Every attempt hit a provider quota error
    #[error("Upstream quota exhausted after {attempts} attempts: {last}")]
    ExhaustedAfterRetries {
        attempts: u32,
        #[source]
        last: ProviderError,
    },

    /// The caller abandoned the request
    #[error("Generation cancelled")]
    Cancelled,

    /// Non-quota provider failure, passed through unchanged
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl QuotaError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            QuotaError::RateLimited { .. } => "RATE_LIMITED",
            QuotaError::WouldExceed { .. } => "QUOTA_WOULD_EXCEED",
            QuotaError::ExhaustedAfterRetries { .. } => "QUOTA_EXHAUSTED_AFTER_RETRIES",
            QuotaError::Cancelled => "CANCELLED",
            QuotaError::Provider(_) => "UPSTREAM_ERROR",
        }
    }

    /// Advisable wait before trying again, when one is known
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            QuotaError::RateLimited { retry_after } => Some(*retry_after),
            QuotaError::WouldExceed { resets_in, .. } => Some(*resets_in),
            QuotaError::ExhaustedAfterRetries { last, .. } => last.retry_delay,
            _ => None,
        }
    }

    /// Whether the failure is a "try again later" condition
    pub fn is_quota(&self) -> bool {
        matches!(
            self,
            QuotaError::RateLimited { .. }
                | QuotaError::WouldExceed { .. }
                | QuotaError::ExhaustedAfterRetries { .. }
        )
    }
}
