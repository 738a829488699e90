//! Upstream Quota Governance
//!
//! Gates calls to an externally rate-limited AI provider so the process stays
//! inside its own per-minute and per-day budget and respects the cool-downs
//! the provider imposes. This is distinct from [`crate::rate_limit`], which
//! protects the service's own endpoints from its clients.
//!
//! # Architecture
//!
//! ```text
//! caller ──► QuotaGovernor ──► QuotaState (local admission, lazy expiry)
//!                 │
//!                 └──► with_retry (timeout, cancellation) ──► GenerationProvider
//! ```

pub mod error;
pub mod governor;
pub mod provider;
pub mod state;

pub use error::{QuotaError, QuotaWindow};
pub use governor::QuotaGovernor;
pub use provider::{GenerationProvider, HttpProvider, HttpProviderSettings, ProviderError};
pub use state::{QuotaConfig, QuotaState, QuotaStatus};
