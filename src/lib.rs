//! QuotaGuard Library
//!
//! Admission control for a service that fronts a quota-limited AI provider:
//! inbound rate limiting of the service's own endpoints, governance of the
//! outbound provider budget, and the retry/timeout primitive both rely on.

pub mod clock;
pub mod config;
pub mod metrics;
pub mod quota;
pub mod rate_limit;
pub mod retry;
pub mod server;
pub mod telemetry;
