//! Window Algorithms
//!
//! Pure decision functions for the two window strategies. They take the
//! snapshot read inside a store transaction and return the decision plus the
//! record to write back, so the limiter only has to glue them to a transaction.
//!
//! The fixed window is O(1) per bucket but admits up to `2 * limit` requests
//! across a bucket boundary. That is the accepted price of the strategy.

use serde::{Deserialize, Serialize};

/// Persisted request log for a sliding window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlidingWindowRecord {
    /// Admitted request instants (epoch ms)
    pub requests: Vec<i64>,

    /// Last write (epoch ms)
    pub last_updated: i64,
}

/// Persisted counter for one fixed-window bucket
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixedWindowRecord {
    /// Requests admitted in this bucket
    pub count: u32,

    /// Bucket start (epoch ms, inclusive)
    pub window_start: i64,

    /// Bucket end (epoch ms, exclusive)
    pub window_end: i64,

    /// Last write (epoch ms)
    pub last_updated: i64,
}

/// Outcome of one scope check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    /// Whether the request is admitted
    pub allowed: bool,

    /// Configured limit
    pub limit: u32,

    /// Requests left in the window
    pub remaining: u32,

    /// When the window frees capacity (epoch ms)
    pub reset_time_ms: i64,

    /// How long to wait before retrying (only on denial)
    pub retry_after_ms: Option<i64>,
}

impl RateLimitDecision {
    fn allowed(limit: u32, remaining: u32, reset_time_ms: i64) -> Self {
        Self {
            allowed: true,
            limit,
            remaining,
            reset_time_ms,
            retry_after_ms: None,
        }
    }

    fn denied(limit: u32, reset_time_ms: i64, retry_after_ms: i64) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            reset_time_ms,
            retry_after_ms: Some(retry_after_ms.max(0)),
        }
    }

    /// Decision used when rate limiting is disabled or bypassed
    pub fn unlimited(now_ms: i64) -> Self {
        Self::allowed(u32::MAX, u32::MAX, now_ms)
    }
}

/// Decision plus the record to persist (`None` = no write)
#[derive(Debug, Clone, PartialEq)]
pub struct WindowOutcome<R> {
    pub decision: RateLimitDecision,
    pub write: Option<R>,
}

/// Evaluate a sliding-window request log at `now_ms`
pub fn evaluate_sliding(
    record: Option<SlidingWindowRecord>,
    limit: u32,
    window_ms: u64,
    now_ms: i64,
    skip_increment: bool,
) -> WindowOutcome<SlidingWindowRecord> {
    let window_ms = i64::try_from(window_ms).unwrap_or(i64::MAX);
    let window_start = now_ms.saturating_sub(window_ms);
    let cap = limit as usize;

    let mut requests: Vec<i64> = record
        .map(|r| r.requests)
        .unwrap_or_default()
        .into_iter()
        .filter(|t| *t >= window_start)
        .collect();

    // A log written under a larger limit keeps only its newest entries
    if requests.len() > cap {
        requests.sort_unstable();
        requests.drain(..requests.len() - cap);
    }

    let oldest = requests.iter().min().copied();

    if requests.len() >= cap {
        let oldest = oldest.unwrap_or(now_ms);
        let reset = oldest.saturating_add(window_ms);
        return WindowOutcome {
            decision: RateLimitDecision::denied(limit, reset, reset - now_ms),
            write: None,
        };
    }

    let reset = match oldest {
        Some(oldest) => oldest.saturating_add(window_ms),
        None => now_ms.saturating_add(window_ms),
    };

    let write = if skip_increment {
        None
    } else {
        requests.push(now_ms);
        Some(SlidingWindowRecord {
            requests: requests.clone(),
            last_updated: now_ms,
        })
    };

    let remaining = limit.saturating_sub(requests.len() as u32);
    WindowOutcome {
        decision: RateLimitDecision::allowed(limit, remaining, reset),
        write,
    }
}

/// Start of the fixed-window bucket containing `now_ms`
pub fn fixed_window_start(now_ms: i64, window_ms: u64) -> i64 {
    let window_ms = i64::try_from(window_ms).unwrap_or(i64::MAX).max(1);
    now_ms.div_euclid(window_ms) * window_ms
}

/// Evaluate a fixed-window bucket at `now_ms`
///
/// `record` must be the document stored under the bucket key for
/// [`fixed_window_start`]; a record from another bucket counts as empty.
pub fn evaluate_fixed(
    record: Option<FixedWindowRecord>,
    limit: u32,
    window_ms: u64,
    now_ms: i64,
    skip_increment: bool,
) -> WindowOutcome<FixedWindowRecord> {
    let window_start = fixed_window_start(now_ms, window_ms);
    let window_end = window_start.saturating_add(i64::try_from(window_ms).unwrap_or(i64::MAX));

    let count = record
        .filter(|r| r.window_start == window_start)
        .map(|r| r.count)
        .unwrap_or(0);

    if count >= limit {
        return WindowOutcome {
            decision: RateLimitDecision::denied(limit, window_end, window_end - now_ms),
            write: None,
        };
    }

    let (count, write) = if skip_increment {
        (count, None)
    } else {
        let count = count + 1;
        (
            count,
            Some(FixedWindowRecord {
                count,
                window_start,
                window_end,
                last_updated: now_ms,
            }),
        )
    };

    WindowOutcome {
        decision: RateLimitDecision::allowed(limit, limit - count, window_end),
        write,
    }
}
