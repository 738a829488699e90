//! Property-Based Tests for the Window Algorithms
//!
//! Drives the sliding and fixed window evaluators with random arrival
//! sequences and checks the admission invariants:
//!
//! - **Sliding**: no trailing window of `window_ms` ever holds more than
//!   `limit` admitted requests, and the stored log never exceeds `limit`
//! - **Fixed**: no bucket admits more than `limit` requests
//! - **Denials**: remaining is zero, and a sliding denial's retry-after
//!   lands exactly when the oldest request in the window expires
//! - **Probes**: `skip_increment` never produces a write
//!
//! ```bash
//! cargo test --lib rate_limit::proptests
//! ```

use proptest::prelude::*;
use std::collections::HashMap;

use super::window::{evaluate_fixed, evaluate_sliding, fixed_window_start};

// Helper: strictly non-decreasing arrival instants
fn arb_arrivals() -> impl Strategy<Value = Vec<i64>> {
    prop::collection::vec(0i64..5_000, 1..120).prop_map(|gaps| {
        let mut now = 1_700_000_000_000i64;
        gaps.into_iter()
            .map(|gap| {
                now += gap;
                now
            })
            .collect()
    })
}

proptest! {
    /// Sliding window never admits more than `limit` within any trailing window
    #[test]
    fn prop_sliding_window_bounded(
        limit in 1u32..20,
        window_ms in 100u64..30_000,
        arrivals in arb_arrivals()
    ) {
        let mut record = None;
        let mut admitted: Vec<i64> = Vec::new();

        for now in arrivals {
            let outcome = evaluate_sliding(record.clone(), limit, window_ms, now, false);
            if outcome.decision.allowed {
                admitted.push(now);
                let stored = outcome.write.clone().unwrap();
                prop_assert!(stored.requests.len() <= limit as usize);
                record = outcome.write;
            } else {
                prop_assert_eq!(outcome.decision.remaining, 0);
                prop_assert!(outcome.write.is_none());

                // Capacity returns when the oldest request in the window ages out
                let oldest = admitted
                    .iter()
                    .copied()
                    .filter(|t| *t >= now - window_ms as i64)
                    .min()
                    .unwrap();
                let retry_after = outcome.decision.retry_after_ms.unwrap();
                prop_assert!(retry_after >= 0);
                prop_assert_eq!(now + retry_after, oldest + window_ms as i64);
                prop_assert_eq!(outcome.decision.reset_time_ms, oldest + window_ms as i64);
            }

            let in_window = admitted
                .iter()
                .filter(|t| **t >= now - window_ms as i64)
                .count();
            prop_assert!(in_window <= limit as usize);
        }
    }

    /// Fixed window never admits more than `limit` per bucket
    #[test]
    fn prop_fixed_window_bounded(
        limit in 1u32..20,
        window_ms in 100u64..30_000,
        arrivals in arb_arrivals()
    ) {
        let mut record = None;
        let mut per_bucket: HashMap<i64, u32> = HashMap::new();

        for now in arrivals {
            let outcome = evaluate_fixed(record.clone(), limit, window_ms, now, false);
            if outcome.decision.allowed {
                *per_bucket.entry(fixed_window_start(now, window_ms)).or_default() += 1;
                record = outcome.write;
            } else {
                prop_assert_eq!(outcome.decision.remaining, 0);
                prop_assert!(outcome.decision.retry_after_ms.unwrap() > 0);
            }
        }

        prop_assert!(per_bucket.values().all(|count| *count <= limit));
    }

    /// Probes report capacity without consuming it
    #[test]
    fn prop_probe_never_writes(
        limit in 1u32..20,
        window_ms in 100u64..30_000,
        now in 0i64..10_000_000
    ) {
        let sliding = evaluate_sliding(None, limit, window_ms, now, true);
        prop_assert!(sliding.write.is_none());
        prop_assert_eq!(sliding.decision.remaining, limit);

        let fixed = evaluate_fixed(None, limit, window_ms, now, true);
        prop_assert!(fixed.write.is_none());
        prop_assert_eq!(fixed.decision.remaining, limit);
    }
}
