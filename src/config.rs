// Configuration File Support
//
// Configuration for the quotaguard service. Supports TOML format with
// environment variable overrides.
// Configuration files are loaded from the XDG config directory: ~/.config/quotaguard/config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::quota::{HttpProviderSettings, QuotaConfig};
use crate::rate_limit::RateLimitConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// HTTP server configuration
    pub server: ServerConfig,

    /// Inbound rate limit policies
    pub rate_limit: RateLimitConfig,

    /// Upstream quota budget
    pub quota: QuotaConfig,

    /// Upstream provider connection
    pub provider: ProviderConfig,

    /// Background maintenance
    pub maintenance: MaintenanceConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub host: String,

    /// Listen port
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    /// Socket address to bind
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid server address {}:{}", self.host, self.port))
    }

    /// Base URL clients use to reach this server
    pub fn base_url(&self) -> String {
        let host = if self.host == "0.0.0.0" { "127.0.0.1" } else { &self.host };
        format!("http://{}:{}", host, self.port)
    }
}

/// Upstream provider configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProviderConfig {
    /// API root
    pub base_url: String,

    /// Model name
    pub model: String,

    /// Name of the environment variable holding the API key
    pub api_key_env: String,

    /// Transport timeout in seconds
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://generativelanguage.googleapis.com".to_string(),
            model: "gemini-1.5-flash".to_string(),
            api_key_env: "GEMINI_API_KEY".to_string(),
            timeout_secs: 60,
        }
    }
}

impl ProviderConfig {
    /// API key from the configured environment variable
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }

    /// Connection settings for the HTTP provider
    pub fn settings(&self) -> Result<HttpProviderSettings> {
        let api_key = self.api_key().with_context(|| {
            format!("Provider API key not set (expected in ${})", self.api_key_env)
        })?;
        Ok(HttpProviderSettings {
            base_url: self.base_url.clone(),
            model: self.model.clone(),
            api_key,
            timeout: Duration::from_secs(self.timeout_secs),
        })
    }
}

/// Background maintenance configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Run periodic compaction of expired rate limit records
    pub enabled: bool,

    /// Compaction interval in seconds
    pub interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
        }
    }
}

impl MaintenanceConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Serve Prometheus metrics at /metrics
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Config {
    /// Load configuration from the default XDG config directory
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed, or
    /// if the resulting configuration is invalid. A missing file yields the
    /// defaults (plus environment overrides).
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            config
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            Self::default()
        };

        // Apply environment variable overrides
        let config = config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path
    ///
    /// Returns `~/.config/quotaguard/config.toml` on Linux/Mac
    pub fn config_path() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("com", "quotaguard", "quotaguard") {
            proj_dirs.config_dir().join("config.toml")
        } else {
            // Fallback if XDG dirs cannot be determined
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".config").join("quotaguard").join("config.toml")
        }
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Environment variables take precedence over config file values:
    /// - QUOTAGUARD_LOG_LEVEL
    /// - QUOTAGUARD_LOG_FORMAT
    /// - QUOTAGUARD_HOST
    /// - QUOTAGUARD_PORT
    /// - QUOTAGUARD_RATE_LIMIT_ENABLED
    /// - QUOTAGUARD_REQUESTS_PER_MINUTE
    /// - QUOTAGUARD_REQUESTS_PER_DAY
    /// - QUOTAGUARD_PROVIDER_URL
    /// - QUOTAGUARD_PROVIDER_MODEL
    /// - QUOTAGUARD_COMPACTION_INTERVAL_SECS
    /// - QUOTAGUARD_METRICS_ENABLED
    fn apply_env_overrides(mut self) -> Self {
        // Logging overrides
        if let Ok(level) = std::env::var("QUOTAGUARD_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("QUOTAGUARD_LOG_FORMAT") {
            self.logging.format = format;
        }

        // Server overrides
        if let Ok(host) = std::env::var("QUOTAGUARD_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("QUOTAGUARD_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.server.port = port;
            }
        }

        // Rate limit overrides
        if let Ok(enabled) = std::env::var("QUOTAGUARD_RATE_LIMIT_ENABLED") {
            self.rate_limit.enabled = enabled.parse().unwrap_or(self.rate_limit.enabled);
        }

        // Quota overrides
        if let Ok(rpm) = std::env::var("QUOTAGUARD_REQUESTS_PER_MINUTE") {
            if let Ok(rpm) = rpm.parse::<u32>() {
                if rpm > 0 {
                    self.quota.requests_per_minute = rpm;
                }
            }
        }
        if let Ok(rpd) = std::env::var("QUOTAGUARD_REQUESTS_PER_DAY") {
            if let Ok(rpd) = rpd.parse::<u32>() {
                if rpd > 0 {
                    self.quota.requests_per_day = rpd;
                }
            }
        }

        // Provider overrides
        if let Ok(url) = std::env::var("QUOTAGUARD_PROVIDER_URL") {
            self.provider.base_url = url;
        }
        if let Ok(model) = std::env::var("QUOTAGUARD_PROVIDER_MODEL") {
            self.provider.model = model;
        }

        // Maintenance overrides
        if let Ok(interval) = std::env::var("QUOTAGUARD_COMPACTION_INTERVAL_SECS") {
            if let Ok(interval) = interval.parse::<u64>() {
                if interval > 0 {
                    self.maintenance.interval_secs = interval;
                }
            }
        }

        // Metrics overrides
        if let Ok(enabled) = std::env::var("QUOTAGUARD_METRICS_ENABLED") {
            self.metrics.enabled = enabled.parse().unwrap_or(self.metrics.enabled);
        }

        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        // Validate logging level
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!("Invalid log level: {}. Must be one of: trace, debug, info, warn, error", self.logging.level),
        }

        // Validate logging format
        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!("Invalid log format: {}. Must be one of: json, pretty, compact", self.logging.format),
        }

        self.server.bind_addr()?;

        self.rate_limit
            .validate()
            .context("Invalid [rate_limit] configuration")?;
        self.quota.validate().context("Invalid [quota] configuration")?;

        if self.provider.base_url.is_empty() || self.provider.model.is_empty() {
            anyhow::bail!("Provider base_url and model must be set");
        }

        if self.maintenance.enabled && self.maintenance.interval_secs == 0 {
            anyhow::bail!("Maintenance interval must be > 0 seconds");
        }

        Ok(())
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging.level.to_lowercase().parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }
}
