//! Orchestrator configuration.
//!
//! Covers the broadcast channel, the bridge timeout, metering defaults, and
//! usage reporting. Source selection is not configured here: it travels with
//! each run's input.

use std::time::Duration;
use thiserror::Error;

use crate::bridge::DEFAULT_BRIDGE_TIMEOUT;
use crate::broadcast::RESEARCH_CHANNEL;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for the run orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Channel every run event is broadcast on.
    pub channel: String,
    /// Longest a worker waits for a bridged call before moving on.
    pub bridge_timeout: Duration,

    // Metering settings
    /// Provider used when a pipeline does not name one.
    pub default_provider: String,
    /// Rate limit attached to snapshots when a pipeline does not set one.
    pub default_rate_limit: Option<u64>,

    // Usage reporting
    /// Period of the usage monitor's log lines.
    pub usage_log_interval: Duration,
    /// Broadcast a last `token_usage` snapshot before each terminal event.
    pub emit_final_usage: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            channel: RESEARCH_CHANNEL.to_string(),
            bridge_timeout: DEFAULT_BRIDGE_TIMEOUT,
            default_provider: "groq".to_string(),
            default_rate_limit: None,
            usage_log_interval: Duration::from_secs(30),
            emit_final_usage: true,
        }
    }
}

impl OrchestratorConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `RUNFORGE_CHANNEL`: Broadcast channel (default: research)
    /// - `RUNFORGE_BRIDGE_TIMEOUT_MS`: Bridge timeout in milliseconds (default: 5000)
    /// - `RUNFORGE_DEFAULT_PROVIDER`: Default metering provider (default: groq)
    /// - `RUNFORGE_RATE_LIMIT`: Default rate limit in units per minute (default: unset)
    /// - `RUNFORGE_USAGE_LOG_INTERVAL_SECS`: Usage log period (default: 30)
    /// - `RUNFORGE_EMIT_FINAL_USAGE`: Final usage snapshot toggle (default: true)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup("RUNFORGE_CHANNEL") {
            config.channel = val;
        }

        if let Some(val) = lookup("RUNFORGE_BRIDGE_TIMEOUT_MS") {
            let millis: u64 = parse_env_value(&val, "RUNFORGE_BRIDGE_TIMEOUT_MS")?;
            config.bridge_timeout = Duration::from_millis(millis);
        }

        // Metering settings
        if let Some(val) = lookup("RUNFORGE_DEFAULT_PROVIDER") {
            config.default_provider = val;
        }

        if let Some(val) = lookup("RUNFORGE_RATE_LIMIT") {
            config.default_rate_limit = Some(parse_env_value(&val, "RUNFORGE_RATE_LIMIT")?);
        }

        // Usage reporting
        if let Some(val) = lookup("RUNFORGE_USAGE_LOG_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "RUNFORGE_USAGE_LOG_INTERVAL_SECS")?;
            config.usage_log_interval = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("RUNFORGE_EMIT_FINAL_USAGE") {
            config.emit_final_usage = parse_env_bool(&val, "RUNFORGE_EMIT_FINAL_USAGE")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "channel cannot be empty".to_string(),
            ));
        }

        if self.bridge_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "bridge_timeout must be greater than 0".to_string(),
            ));
        }

        if self.default_provider.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "default_provider cannot be empty".to_string(),
            ));
        }

        if self.default_rate_limit == Some(0) {
            return Err(ConfigError::ValidationFailed(
                "default_rate_limit must be greater than 0 when set".to_string(),
            ));
        }

        if self.usage_log_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "usage_log_interval must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to set the broadcast channel.
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    /// Builder method to set the bridge timeout.
    pub fn with_bridge_timeout(mut self, timeout: Duration) -> Self {
        self.bridge_timeout = timeout;
        self
    }

    /// Builder method to set the default provider.
    pub fn with_default_provider(mut self, provider: impl Into<String>) -> Self {
        self.default_provider = provider.into();
        self
    }

    /// Builder method to set the default rate limit.
    pub fn with_default_rate_limit(mut self, limit: u64) -> Self {
        self.default_rate_limit = Some(limit);
        self
    }

    /// Builder method to set the usage log interval.
    pub fn with_usage_log_interval(mut self, interval: Duration) -> Self {
        self.usage_log_interval = interval;
        self
    }

    /// Builder method to enable or disable the final usage snapshot.
    pub fn with_final_usage(mut self, enabled: bool) -> Self {
        self.emit_final_usage = enabled;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}
