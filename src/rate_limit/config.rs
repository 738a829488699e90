//! Rate Limit Configuration
//!
//! Static per-endpoint policies. A policy is immutable once the limiter has
//! been built from it; unknown endpoints fall back to `default_policy`.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use super::key::Scope;

/// Default per-user limit for unknown endpoints (requests per minute)
pub const DEFAULT_USER_LIMIT: u32 = 30;
/// Default per-IP limit for unknown endpoints (requests per minute)
pub const DEFAULT_IP_LIMIT: u32 = 60;
/// Default window for unknown endpoints
pub const DEFAULT_WINDOW_MS: u64 = 60_000;

/// Longest accepted window (one year)
pub const MAX_WINDOW_MS: u64 = 366 * 86_400_000;

/// Endpoint used by the question generation route
pub const GENERATE_ENDPOINT: &str = "generate_questions";

/// Window algorithm for a scope
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Exact request log over a trailing window
    #[default]
    SlidingWindow,
    /// Counter per discrete window bucket; admits up to 2x limit across a boundary
    FixedWindow,
}

/// What to do with a request when the shared store cannot be reached
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Reject the request with an infrastructure error
    #[default]
    FailClosed,
    /// Admit the request and record the failure
    FailOpen,
}

/// Limit for one scope of one endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopePolicy {
    /// Requests admitted per window
    pub limit: u32,

    /// Window length in milliseconds
    pub window_ms: u64,

    /// Window algorithm
    #[serde(default)]
    pub strategy: Strategy,

    /// Message returned to clients on denial
    #[serde(default)]
    pub message: Option<String>,
}

impl ScopePolicy {
    /// Sliding-window policy
    pub fn sliding(limit: u32, window_ms: u64) -> Self {
        Self {
            limit,
            window_ms,
            strategy: Strategy::SlidingWindow,
            message: None,
        }
    }

    /// Fixed-window policy
    pub fn fixed(limit: u32, window_ms: u64) -> Self {
        Self {
            limit,
            window_ms,
            strategy: Strategy::FixedWindow,
            message: None,
        }
    }

    /// Attach a denial message
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Window as a duration
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Message for a denied request in `scope`
    pub fn denial_message(&self, scope: Scope) -> String {
        self.message
            .clone()
            .unwrap_or_else(|| format!("Too many requests ({} limit exceeded)", scope.label()))
    }
}

/// Policies for one logical endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointPolicy {
    /// Per authenticated user
    #[serde(default)]
    pub per_user: Option<ScopePolicy>,

    /// Per client IP address
    #[serde(default)]
    pub per_ip: Option<ScopePolicy>,

    /// Shared by every caller
    #[serde(default)]
    pub global: Option<ScopePolicy>,

    /// Behaviour on store failure
    #[serde(default)]
    pub failure_mode: FailureMode,
}

impl EndpointPolicy {
    /// Conservative policy used for endpoints with no explicit configuration
    pub fn conservative() -> Self {
        Self {
            per_user: Some(ScopePolicy::sliding(DEFAULT_USER_LIMIT, DEFAULT_WINDOW_MS)),
            per_ip: Some(ScopePolicy::sliding(DEFAULT_IP_LIMIT, DEFAULT_WINDOW_MS)),
            global: None,
            failure_mode: FailureMode::FailClosed,
        }
    }

    /// Policy for a scope, if configured
    pub fn scope(&self, scope: Scope) -> Option<&ScopePolicy> {
        match scope {
            Scope::User => self.per_user.as_ref(),
            Scope::Ip => self.per_ip.as_ref(),
            Scope::Global => self.global.as_ref(),
        }
    }

    /// Longest window across configured scopes
    pub fn max_window_ms(&self) -> u64 {
        Scope::ALL
            .iter()
            .filter_map(|s| self.scope(*s))
            .map(|p| p.window_ms)
            .max()
            .unwrap_or(0)
    }

    fn validate(&self, name: &str) -> Result<()> {
        for scope in Scope::ALL {
            if let Some(policy) = self.scope(scope) {
                if policy.limit == 0 {
                    anyhow::bail!(
                        "Endpoint '{}' {} limit must be > 0",
                        name,
                        scope.label()
                    );
                }
                if policy.window_ms == 0 || policy.window_ms > MAX_WINDOW_MS {
                    anyhow::bail!(
                        "Endpoint '{}' {} window must be between 1 and {} ms",
                        name,
                        scope.label(),
                        MAX_WINDOW_MS
                    );
                }
            }
        }
        Ok(())
    }
}

/// Rate limit configuration for every endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,

    /// Fallback for endpoints not listed in `endpoints`
    pub default_policy: EndpointPolicy,

    /// Per-endpoint policies
    pub endpoints: HashMap<String, EndpointPolicy>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let mut endpoints = HashMap::new();
        endpoints.insert(
            GENERATE_ENDPOINT.to_string(),
            EndpointPolicy {
                per_user: Some(
                    ScopePolicy::sliding(10, 3_600_000)
                        .with_message("Question generation limit reached. Try again later."),
                ),
                per_ip: Some(ScopePolicy::sliding(20, 3_600_000)),
                global: Some(ScopePolicy::fixed(500, 3_600_000)),
                failure_mode: FailureMode::FailClosed,
            },
        );
        endpoints.insert(
            "submit_answers".to_string(),
            EndpointPolicy {
                per_user: Some(ScopePolicy::fixed(60, 60_000)),
                per_ip: Some(ScopePolicy::fixed(120, 60_000)),
                global: None,
                failure_mode: FailureMode::FailOpen,
            },
        );

        Self {
            enabled: true,
            default_policy: EndpointPolicy::conservative(),
            endpoints,
        }
    }
}

impl RateLimitConfig {
    /// Create a new rate limit configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Disable rate limiting (for testing)
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Configuration with a single endpoint and no other policies
    pub fn single(endpoint: &str, policy: EndpointPolicy) -> Self {
        let mut endpoints = HashMap::new();
        endpoints.insert(endpoint.to_string(), policy);
        Self {
            enabled: true,
            default_policy: EndpointPolicy::conservative(),
            endpoints,
        }
    }

    /// Policy for an endpoint, falling back to the default policy
    pub fn policy_for(&self, endpoint: &str) -> &EndpointPolicy {
        self.endpoints.get(endpoint).unwrap_or(&self.default_policy)
    }

    /// Longest window of any configured policy
    pub fn max_window(&self) -> Duration {
        let max_ms = self
            .endpoints
            .values()
            .chain(std::iter::once(&self.default_policy))
            .map(EndpointPolicy::max_window_ms)
            .max()
            .unwrap_or(0);
        Duration::from_millis(max_ms)
    }

    /// Validate every policy
    pub fn validate(&self) -> Result<()> {
        self.default_policy.validate("<default>")?;
        for (name, policy) in &self.endpoints {
            if name.is_empty() {
                anyhow::bail!("Endpoint names must not be empty");
            }
            policy.validate(name)?;
        }
        Ok(())
    }
}
