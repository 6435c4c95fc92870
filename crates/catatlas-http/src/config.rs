//! API client configuration
//!
//! Settings come from built-in defaults, then an optional TOML file, then
//! `CATATLAS__*` environment variables (`CATATLAS__RETRY__MAX_ATTEMPTS=5`).

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::{
    circuit_breaker::CircuitBreakerConfig,
    error::{HttpError, Result},
    retry::RetryConfig,
};

/// Environment variable prefix
pub const ENV_PREFIX: &str = "CATATLAS";

/// API client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL endpoints are joined onto
    #[serde(default)]
    pub base_url: Option<String>,

    /// Per-attempt timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Custom user agent
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
}

/// Retry section of [`ClientConfig`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Total attempts including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

/// Circuit breaker section of [`ClientConfig`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Breaker name used in logs and fail-fast messages
    #[serde(default = "default_breaker_name")]
    pub name: String,

    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    #[serde(default = "default_open_duration_ms")]
    pub open_duration_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_ms: default_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            user_agent: default_user_agent(),
            retry: RetrySettings::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            name: default_breaker_name(),
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            open_duration_ms: default_open_duration_ms(),
        }
    }
}

impl ClientConfig {
    /// Create a new client config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Create config for fast operations (5s timeout, no retries)
    pub fn fast() -> Self {
        Self {
            timeout_ms: 5_000,
            connect_timeout_ms: 2_000,
            retry: RetrySettings {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Create config for long operations (60s timeout, 3 attempts, 2s backoff)
    pub fn long() -> Self {
        Self {
            timeout_ms: 60_000,
            connect_timeout_ms: 10_000,
            retry: RetrySettings {
                initial_delay_ms: 2_000,
                max_delay_ms: 30_000,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Load from defaults, an optional TOML file, and `CATATLAS__*` variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    /// Like [`ClientConfig::load`] with a custom environment prefix
    pub fn load_with_prefix(path: Option<&Path>, env_prefix: &str) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                File::from(path.to_path_buf())
                    .format(FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            Environment::with_prefix(env_prefix)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: ClientConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(HttpError::Config(
                "timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(HttpError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if !self.retry.backoff_multiplier.is_finite() || self.retry.backoff_multiplier <= 0.0 {
            return Err(HttpError::Config(
                "retry.backoff_multiplier must be a positive number".to_string(),
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(HttpError::Config(
                "circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.circuit_breaker.success_threshold == 0 {
            return Err(HttpError::Config(
                "circuit_breaker.success_threshold must be at least 1".to_string(),
            ));
        }
        if let Some(base_url) = &self.base_url {
            let url = url::Url::parse(base_url)
                .map_err(|e| HttpError::InvalidUrl(format!("{base_url}: {e}")))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(HttpError::InvalidUrl(format!(
                    "{base_url}: unsupported scheme {}",
                    url.scheme()
                )));
            }
        }
        Ok(())
    }

    /// Render as TOML, the format [`ClientConfig::load`] reads
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| HttpError::Config(e.to_string()))
    }

    /// Per-attempt timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Retry policy for requests, `None` when retries are disabled
    pub fn retry_config(&self) -> Option<RetryConfig> {
        let retry = &self.retry;
        retry.enabled.then(|| {
            RetryConfig::new()
                .with_max_attempts(retry.max_attempts)
                .with_initial_delay(Duration::from_millis(retry.initial_delay_ms))
                .with_max_delay(Duration::from_millis(retry.max_delay_ms))
                .with_backoff_multiplier(retry.backoff_multiplier)
        })
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        let breaker = &self.circuit_breaker;
        CircuitBreakerConfig::new()
            .with_failure_threshold(breaker.failure_threshold)
            .with_success_threshold(breaker.success_threshold)
            .with_open_duration(Duration::from_millis(breaker.open_duration_ms))
    }

    /// Set base URL
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Set per-attempt timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set user agent
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }
}

// Default value functions for serde
fn default_timeout_ms() -> u64 {
    30_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_user_agent() -> String {
    format!("CatAtlas/{}", env!("CARGO_PKG_VERSION"))
}

fn default_enabled() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_breaker_name() -> String {
    "catatlas-api".to_string()
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_open_duration_ms() -> u64 {
    60_000
}
