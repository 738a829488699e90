//! `X-RateLimit-*` response headers

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;

use super::window::RateLimitDecision;

pub const LIMIT_HEADER: &str = "X-RateLimit-Limit";
pub const REMAINING_HEADER: &str = "X-RateLimit-Remaining";
pub const RESET_HEADER: &str = "X-RateLimit-Reset";
pub const RETRY_AFTER_HEADER: &str = "X-RateLimit-RetryAfter";

/// Header values for one admission outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitHeaders {
    /// Configured limit
    pub limit: u32,

    /// Requests left (floored at zero)
    pub remaining: u32,

    /// Window reset, epoch seconds
    pub reset: i64,

    /// Seconds to wait before retrying (denials only)
    pub retry_after: Option<i64>,
}

fn ceil_secs(ms: i64) -> i64 {
    ms.saturating_add(999).div_euclid(1000)
}

impl RateLimitHeaders {
    /// Build headers from a scope decision
    pub fn from_decision(decision: &RateLimitDecision) -> Self {
        Self {
            limit: decision.limit,
            remaining: if decision.allowed { decision.remaining } else { 0 },
            reset: ceil_secs(decision.reset_time_ms),
            retry_after: decision.retry_after_ms.map(|ms| ceil_secs(ms.max(0))),
        }
    }

    /// Header name/value pairs in canonical spelling
    pub fn pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            (LIMIT_HEADER, self.limit.to_string()),
            (REMAINING_HEADER, self.remaining.to_string()),
            (RESET_HEADER, self.reset.to_string()),
        ];
        if let Some(retry_after) = self.retry_after {
            pairs.push((RETRY_AFTER_HEADER, retry_after.to_string()));
        }
        pairs
    }

    /// Copy the headers onto an outgoing response
    pub fn apply(&self, headers: &mut HeaderMap) {
        for (name, value) in self.pairs() {
            let name = HeaderName::from_bytes(name.as_bytes());
            let value = HeaderValue::from_str(&value);
            if let (Ok(name), Ok(value)) = (name, value) {
                headers.insert(name, value);
            }
        }
    }

    /// Headers as a fresh map
    pub fn to_header_map(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        self.apply(&mut headers);
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_headers() {
        let decision = RateLimitDecision {
            allowed: true,
            limit: 10,
            remaining: 7,
            reset_time_ms: 1_700_000_000_500,
            retry_after_ms: None,
        };
        let headers = RateLimitHeaders::from_decision(&decision);
        assert_eq!(headers.reset, 1_700_000_001);
        assert_eq!(headers.retry_after, None);

        let map = headers.to_header_map();
        assert_eq!(map.get("x-ratelimit-limit").unwrap(), "10");
        assert_eq!(map.get("x-ratelimit-remaining").unwrap(), "7");
        assert!(map.get("x-ratelimit-retryafter").is_none());
    }

    #[test]
    fn test_denied_headers_have_zero_remaining() {
        let decision = RateLimitDecision {
            allowed: false,
            limit: 3,
            remaining: 0,
            reset_time_ms: 60_000,
            retry_after_ms: Some(59_001),
        };
        let headers = RateLimitHeaders::from_decision(&decision);
        assert_eq!(headers.remaining, 0);
        assert_eq!(headers.retry_after, Some(60));

        let pairs = headers.pairs();
        assert_eq!(pairs.len(), 4);
        assert_eq!(pairs[3], (RETRY_AFTER_HEADER, "60".to_string()));
    }

    #[test]
    fn test_ceil_secs() {
        assert_eq!(ceil_secs(0), 0);
        assert_eq!(ceil_secs(1), 1);
        assert_eq!(ceil_secs(1_000), 1);
        assert_eq!(ceil_secs(1_001), 2);
        assert_eq!(ceil_secs(i64::MAX), i64::MAX / 1_000);
    }
}
