//! Configuration management for Ratewarden.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{RateLimitError, Result};
use crate::ratelimit::{FailurePolicy, LimitTable, RateLimitConfig};

/// Environment variable prefix for configuration overrides.
const ENV_PREFIX: &str = "RATEWARDEN";

/// Main configuration for a Ratewarden instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Identifier for this limiter instance, attached to log output
    #[serde(default = "default_instance_id")]
    pub instance_id: String,

    /// Shared counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Limiter behaviour
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Per-key limits
    #[serde(default)]
    pub limits: Vec<RateLimitConfig>,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            instance_id: default_instance_id(),
            store: StoreConfig::default(),
            limiter: LimiterConfig::default(),
            limits: Vec::new(),
        }
    }
}

fn default_instance_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Shared counter store (Redis) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store host
    #[serde(default = "default_host")]
    pub host: String,

    /// Store port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Logical database index
    #[serde(default)]
    pub database: i64,

    /// Upper bound on a single store round-trip, in milliseconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Connection pool sizing
    #[serde(default)]
    pub pool: PoolConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database: 0,
            request_timeout_ms: default_request_timeout(),
            pool: PoolConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Create a store configuration for the given endpoint with default tuning.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Connection URL for the store.
    pub fn url(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.database)
    }

    /// Request timeout as a `Duration`.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    6379
}

fn default_request_timeout() -> u64 {
    1000
}

/// Connection pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum connections borrowed at once
    #[serde(default = "default_max_total")]
    pub max_total: usize,

    /// Maximum idle connections kept for reuse
    #[serde(default = "default_max_idle")]
    pub max_idle: usize,

    /// Connections opened eagerly at startup
    #[serde(default = "default_min_idle")]
    pub min_idle: usize,

    /// Maximum time to wait for a free connection, in milliseconds
    #[serde(default = "default_max_wait")]
    pub max_wait_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_total: default_max_total(),
            max_idle: default_max_idle(),
            min_idle: default_min_idle(),
            max_wait_ms: default_max_wait(),
        }
    }
}

impl PoolConfig {
    /// Maximum wait for a connection as a `Duration`.
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    /// Check that the sizing knobs are consistent.
    pub fn validate(&self) -> Result<()> {
        if self.max_total == 0 {
            return Err(RateLimitError::Config(
                "pool.max_total must be greater than zero".to_string(),
            ));
        }
        if self.max_idle > self.max_total {
            return Err(RateLimitError::Config(format!(
                "pool.max_idle ({}) must not exceed pool.max_total ({})",
                self.max_idle, self.max_total
            )));
        }
        if self.min_idle > self.max_idle {
            return Err(RateLimitError::Config(format!(
                "pool.min_idle ({}) must not exceed pool.max_idle ({})",
                self.min_idle, self.max_idle
            )));
        }
        Ok(())
    }
}

fn default_max_total() -> usize {
    1000
}

fn default_max_idle() -> usize {
    10
}

fn default_min_idle() -> usize {
    1
}

fn default_max_wait() -> u64 {
    30_000
}

/// Limiter behaviour configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// What to do when the store cannot be reached
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

impl WardenConfig {
    /// Load configuration from a file, with `RATEWARDEN__*` environment
    /// variables layered on top.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .map_err(|e| RateLimitError::Config(format!("{}: {}", path.display(), e)))?;

        Self::from_settings(settings)
    }

    /// Load configuration from environment variables only.
    pub fn from_env() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .map_err(|e| RateLimitError::Config(e.to_string()))?;

        Self::from_settings(settings)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: WardenConfig = serde_yaml::from_str(yaml)
            .map_err(|e| RateLimitError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn from_settings(settings: config::Config) -> Result<Self> {
        let config: WardenConfig = settings
            .try_deserialize()
            .map_err(|e| RateLimitError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check pool sizing and every configured limit.
    pub fn validate(&self) -> Result<()> {
        self.store.pool.validate()?;
        for limit in &self.limits {
            limit.validate()?;
        }
        Ok(())
    }

    /// Build the per-key limit table from the configured limits.
    pub fn limit_table(&self) -> LimitTable {
        LimitTable::from_limits(self.limits.clone())
    }
}
