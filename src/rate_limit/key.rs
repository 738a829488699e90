//! Rate Limit Keys
//!
//! Keys are deterministic strings `{endpoint}:{scope}:{identifier}` so that
//! every process instance addresses the same store document.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Dimension a limit applies to
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Per authenticated user
    User,
    /// Per client IP
    Ip,
    /// Shared by all callers
    Global,
}

impl Scope {
    /// Evaluation order used by `enforce_rate_limit`
    pub const ALL: [Scope; 3] = [Scope::User, Scope::Ip, Scope::Global];

    /// Key segment
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::User => "user",
            Scope::Ip => "ip",
            Scope::Global => "global",
        }
    }

    /// Human-readable name
    pub fn label(&self) -> &'static str {
        match self {
            Scope::User => "per-user",
            Scope::Ip => "per-IP",
            Scope::Global => "global",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier used for the global scope
pub const GLOBAL_IDENTIFIER: &str = "global";

/// Primary key of a rate limit record
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RateLimitKey {
    /// Logical endpoint name
    pub endpoint: String,

    /// Scope
    pub scope: Scope,

    /// User id, IP address, or `global`
    pub identifier: String,
}

impl RateLimitKey {
    /// Create a new key
    pub fn new(endpoint: &str, scope: Scope, identifier: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            scope,
            identifier: identifier.to_string(),
        }
    }

    /// Key for a user
    pub fn user(endpoint: &str, user_id: &str) -> Self {
        Self::new(endpoint, Scope::User, user_id)
    }

    /// Key for an IP address
    pub fn ip(endpoint: &str, ip: &str) -> Self {
        Self::new(endpoint, Scope::Ip, ip)
    }

    /// Key shared by all callers of an endpoint
    pub fn global(endpoint: &str) -> Self {
        Self::new(endpoint, Scope::Global, GLOBAL_IDENTIFIER)
    }

    /// Document key of a fixed-window bucket starting at `window_start`
    pub fn bucket(&self, window_start: i64) -> String {
        format!("{}:{}", self, window_start)
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.endpoint, self.scope, self.identifier)
    }
}
