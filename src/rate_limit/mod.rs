//! Inbound Rate Limiting Module
//!
//! Per-endpoint admission control for the service's own HTTP surface.
//! Policies are applied per user, per IP address and globally, each with a
//! sliding or fixed window. All counting state lives in a shared
//! transactional store so several server processes enforce one budget.
//!
//! # Features
//!
//! - Sliding window (exact request log) and fixed window (bucket counter)
//! - Per-user, per-IP and global scopes evaluated in that order
//! - Explicit fail-open / fail-closed behaviour per endpoint
//! - `X-RateLimit-*` headers and an axum middleware
//! - Background compaction of expired records
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Middleware (axum, per route)                │
//! ├─────────────────────────────────────────────────────────────┤
//! │                        RateLimiter                          │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐          │
//! │  │  per-user   │  │   per-IP    │  │   global    │          │
//! │  └─────────────┘  └─────────────┘  └─────────────┘          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │   TransactionalStore (one transaction per decision)  │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod headers;
pub mod key;
pub mod limiter;
pub mod maintenance;
pub mod middleware;
pub mod store;
pub mod window;

#[cfg(test)]
mod proptests;

pub use config::{EndpointPolicy, FailureMode, RateLimitConfig, ScopePolicy, Strategy};
pub use error::{RateLimitError, StoreError};
pub use headers::RateLimitHeaders;
pub use key::{RateLimitKey, Scope};
pub use limiter::{Enforcement, RateLimiter};
pub use middleware::EndpointGuard;
pub use store::{MemoryStore, TransactionalStore};
pub use window::RateLimitDecision;
