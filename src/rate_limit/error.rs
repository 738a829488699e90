//! Rate Limit Error Types
//!
//! A policy denial is never an error: it is reported through
//! `RateLimitDecision::allowed`. These types describe infrastructure failures
//! so callers can tell "rejected by policy" apart from "could not decide".

/// Errors raised by a transactional store
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Backend could not be reached
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Transaction kept conflicting with concurrent writers
    #[error("Transaction on {key} aborted after {attempts} conflicting attempts")]
    Contention { key: String, attempts: u32 },

    /// Stored document does not match the expected shape
    #[error("Corrupt document at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Errors raised by the inbound rate limiter
#[derive(Debug, Clone, thiserror::Error)]
pub enum RateLimitError {
    /// The admission decision could not be made
    #[error("Rate limit check failed for {key}: {source}")]
    Store {
        key: String,
        #[source]
        source: StoreError,
    },
}

impl RateLimitError {
    /// Wrap a store error for `key`
    pub fn store(key: impl Into<String>, source: StoreError) -> Self {
        RateLimitError::Store {
            key: key.into(),
            source,
        }
    }

    /// Key whose check failed
    pub fn key(&self) -> &str {
        match self {
            RateLimitError::Store { key, .. } => key,
        }
    }
}
