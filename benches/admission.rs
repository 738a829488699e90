// Admission Control Benchmarks
//
// Measures the cost of one admission decision.
//
// Key metrics:
// - Window evaluation over request logs of increasing size
// - Full enforce_rate_limit (three scopes, in-memory store)
// - Dry-run probe (no writes)

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use quotaguard::rate_limit::window::{evaluate_sliding, SlidingWindowRecord};
use quotaguard::rate_limit::{EndpointPolicy, MemoryStore, RateLimitConfig, RateLimiter, ScopePolicy};
use std::hint::black_box;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Runtime;

const NOW: i64 = 1_700_000_000_000;

fn limiter() -> RateLimiter {
    let policy = EndpointPolicy {
        per_user: Some(ScopePolicy::sliding(1_000_000, 60_000)),
        per_ip: Some(ScopePolicy::sliding(1_000_000, 60_000)),
        global: Some(ScopePolicy::fixed(u32::MAX, 60_000)),
        ..Default::default()
    };
    RateLimiter::new(
        RateLimitConfig::single("bench", policy),
        Arc::new(MemoryStore::new()),
    )
}

/// Benchmark: sliding window evaluation by log size
fn bench_evaluate_sliding(c: &mut Criterion) {
    let mut group = c.benchmark_group("evaluate_sliding");

    for size in [10usize, 100, 1_000] {
        let record = SlidingWindowRecord {
            requests: (0..size as i64).map(|i| NOW - 50_000 + i).collect(),
            last_updated: NOW,
        };

        group.bench_with_input(BenchmarkId::from_parameter(size), &record, |b, record| {
            b.iter(|| {
                black_box(evaluate_sliding(
                    Some(record.clone()),
                    (size + 1) as u32,
                    60_000,
                    NOW,
                    false,
                ))
            });
        });
    }

    group.finish();
}

/// Benchmark: enforce across user, IP and global scopes
fn bench_enforce(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let limiter = limiter();
    let counter = AtomicU64::new(0);

    c.bench_function("enforce_rate_limit", |b| {
        b.to_async(&rt).iter(|| {
            let user = format!("user-{}", counter.fetch_add(1, Ordering::Relaxed) % 1_000);
            let limiter = limiter.clone();
            async move {
                let result = limiter
                    .enforce_rate_limit("bench", Some(&user), Some("192.0.2.1"), false)
                    .await
                    .unwrap();
                black_box(result);
            }
        });
    });
}

/// Benchmark: dry-run probe
fn bench_probe(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let limiter = limiter();

    c.bench_function("probe_rate_limit", |b| {
        b.to_async(&rt).iter(|| async {
            let result = limiter
                .enforce_rate_limit("bench", Some("probe-user"), Some("192.0.2.1"), true)
                .await
                .unwrap();
            black_box(result);
        });
    });
}

criterion_group!(benches, bench_evaluate_sliding, bench_enforce, bench_probe);
criterion_main!(benches);
