//! Upstream Generation Provider
//!
//! The governor talks to the upstream AI service through
//! [`GenerationProvider`]. Failures are reported as [`ProviderError`], which
//! carries the HTTP status and the provider's retry hint as typed fields so
//! the governor never has to scrape error text.
//!
//! Providers that only surface a message string (for example SDKs that wrap
//! the HTTP error) can use [`ProviderError::from_message`], which recognises
//! the `[429 Too Many Requests]` status prefix and the `"retryDelay":"30s"`
//! hint embedded in the message.

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use crate::retry::Classify;

lazy_static! {
    static ref STATUS_PATTERN: Regex =
        Regex::new(r"\[(\d{3})(?:\s[^\]]*)?\]").expect("valid status pattern");
    static ref RETRY_DELAY_PATTERN: Regex =
        Regex::new(r#"retryDelay\\?"\s*:\s*\\?"(\d+)s"#).expect("valid retry delay pattern");
}

/// Failure reported by an upstream provider
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct ProviderError {
    /// HTTP status, when known
    pub status: Option<u16>,

    /// Provider message
    pub message: String,

    /// Provider-supplied wait before retrying
    pub retry_delay: Option<Duration>,
}

impl ProviderError {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            retry_delay: None,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    /// Quota rejection (HTTP 429)
    pub fn quota(retry_delay: Option<Duration>) -> Self {
        Self {
            status: Some(429),
            message: "Resource has been exhausted (e.g. check quota).".to_string(),
            retry_delay,
        }
    }

    /// Attempt abandoned after `after` without a response
    pub fn timeout(after: Duration) -> Self {
        Self::new(None, format!("request timed out after {}ms", after.as_millis()))
    }

    /// Build from a bare error message
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let status = STATUS_PATTERN
            .captures(&message)
            .and_then(|c| c[1].parse().ok());
        let retry_delay = parse_retry_delay(&message);
        Self {
            status,
            message,
            retry_delay,
        }
    }

    /// Quota-class failure: HTTP 429, or a message mentioning quota
    pub fn is_quota_error(&self) -> bool {
        self.status == Some(429) || self.message.to_lowercase().contains("quota")
    }
}

impl Classify for ProviderError {
    fn status_code(&self) -> Option<u16> {
        self.status
    }

    fn description(&self) -> String {
        self.message.clone()
    }
}

/// Whole-second `retryDelay` hint embedded in a message
pub fn parse_retry_delay(message: &str) -> Option<Duration> {
    RETRY_DELAY_PATTERN
        .captures(message)
        .and_then(|c| c[1].parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Upstream text generation service
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Generate text for `prompt`
    async fn generate(&self, prompt: &str) -> Result<String, ProviderError>;
}

/// Connection settings for [`HttpProvider`]
#[derive(Debug, Clone)]
pub struct HttpProviderSettings {
    /// API root, e.g. `https://generativelanguage.googleapis.com`
    pub base_url: String,

    /// Model name
    pub model: String,

    /// API key sent as `x-goog-api-key`
    pub api_key: String,

    /// Transport timeout for one request
    pub timeout: Duration,
}

/// `generateContent` client over reqwest
#[derive(Debug, Clone)]
pub struct HttpProvider {
    client: reqwest::Client,
    settings: HttpProviderSettings,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    details: Vec<Value>,
}

/// Parse a `"30s"` / `"1.5s"` protobuf duration
fn parse_proto_duration(value: &str) -> Option<Duration> {
    let seconds: f64 = value.strip_suffix('s')?.parse().ok()?;
    Duration::try_from_secs_f64(seconds).ok()
}

/// Convert an error response into a typed [`ProviderError`]
pub fn parse_error_response(status: u16, body: &str) -> ProviderError {
    let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(body) else {
        let mut err = ProviderError::from_message(body.to_string());
        err.status = Some(status);
        return err;
    };

    let retry_delay = envelope
        .error
        .details
        .iter()
        .filter_map(|d| d.get("retryDelay").and_then(Value::as_str))
        .find_map(parse_proto_duration);

    ProviderError {
        status: Some(envelope.error.code.unwrap_or(status)),
        message: envelope.error.message,
        retry_delay,
    }
}

/// Concatenated text of the first candidate
pub fn parse_generation(body: &Value) -> Option<String> {
    let parts = body
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .as_array()?;
    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

impl HttpProvider {
    pub fn new(settings: HttpProviderSettings) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| ProviderError::new(None, format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, settings })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.settings.base_url.trim_end_matches('/'),
            self.settings.model
        )
    }
}

#[async_trait]
impl GenerationProvider for HttpProvider {
    async fn generate(&self, prompt: &str) -> Result<String, ProviderError> {
        let body = json!({
            "contents": [{ "parts": [{ "text": prompt }] }]
        });

        tracing::debug!(model = %self.settings.model, "Sending generation request");

        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.settings.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                let status = e.status().map(|s| s.as_u16());
                let message = if e.is_timeout() {
                    format!("request timed out: {}", e)
                } else if e.is_connect() {
                    format!("connection failed: {}", e)
                } else {
                    format!("request failed: {}", e)
                };
                ProviderError::new(status, message)
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::new(Some(status.as_u16()), format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(parse_error_response(status.as_u16(), &text));
        }

        let value: Value = serde_json::from_str(&text).map_err(|e| {
            ProviderError::new(Some(status.as_u16()), format!("Invalid generation response: {}", e))
        })?;
        parse_generation(&value).ok_or_else(|| {
            ProviderError::new(Some(status.as_u16()), "Generation response contained no text")
        })
    }
}
