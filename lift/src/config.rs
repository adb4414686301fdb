//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following
//! precedence (highest to lowest):
//! 1. Environment variables (prefix: LIFT_)
//! 2. Current working directory: ./lift.toml
//! 3. Default values

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{LiftError, Result};
use crate::health::HealthConfig;
use crate::middleware::bulkhead::BulkheadConfig;
use crate::middleware::circuit_breaker::CircuitBreakerConfig;
use crate::middleware::load_shed::LoadShedConfig;
use crate::middleware::rate_limit::RateLimitConfig;
use crate::middleware::retry::RetryConfig;
use crate::pool::PoolConfig;

/// Main configuration structure
#[derive(Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Runtime configuration
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Resource pool configuration
    #[serde(default)]
    pub pool: PoolConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Circuit breaker configuration
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Bulkhead configuration
    #[serde(default)]
    pub bulkhead: BulkheadConfig,

    /// Retry configuration
    #[serde(default)]
    pub retry: RetryConfig,

    /// Load shedding configuration
    #[serde(default)]
    pub load_shed: LoadShedConfig,

    /// Health aggregation configuration
    #[serde(default)]
    pub health: HealthConfig,
}

/// Runtime-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Largest accepted request body, in bytes
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,

    /// Largest emitted response body, in bytes
    #[serde(default = "default_max_response_size")]
    pub max_response_size: usize,

    /// Invocation timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Whether metric counters are emitted
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,

    /// Whether trace spans are emitted
    #[serde(default = "default_true")]
    pub tracing_enabled: bool,

    /// Reject requests whose context carries no tenant after the
    /// middleware pre-phase
    #[serde(default)]
    pub require_tenant_id: bool,

    /// Environment (dev, staging, production); development attaches panic
    /// detail to responses
    #[serde(default = "default_environment")]
    pub environment: String,
}

fn default_max_request_size() -> usize {
    6 * 1024 * 1024
}
fn default_max_response_size() -> usize {
    6 * 1024 * 1024
}
fn default_timeout_secs() -> u64 {
    29
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_environment() -> String {
    "production".to_string()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_request_size: default_max_request_size(),
            max_response_size: default_max_response_size(),
            timeout_secs: default_timeout_secs(),
            log_level: default_log_level(),
            metrics_enabled: default_true(),
            tracing_enabled: default_true(),
            require_tenant_id: false,
            environment: default_environment(),
        }
    }
}

impl RuntimeConfig {
    /// Default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the request-size bound
    pub fn with_max_request_size(mut self, bytes: usize) -> Self {
        self.max_request_size = bytes;
        self
    }

    /// Set the response-size bound
    pub fn with_max_response_size(mut self, bytes: usize) -> Self {
        self.max_response_size = bytes;
        self
    }

    /// Set the invocation timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs();
        self
    }

    /// Require an authenticated tenant on every request
    pub fn with_require_tenant_id(mut self, require: bool) -> Self {
        self.require_tenant_id = require;
        self
    }

    /// Set the environment name
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    /// Whether this is a development environment
    pub fn is_development(&self) -> bool {
        matches!(self.environment.as_str(), "dev" | "development" | "local")
    }

    /// Invocation timeout as a duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Load configuration from defaults, `./lift.toml`, and `LIFT_`-prefixed
    /// environment variables
    pub fn load() -> Result<Self> {
        Self::figment()
            .extract()
            .map_err(|e| LiftError::internal(format!("configuration error: {e}")).with_cause(e))
    }

    /// The figment used by [`Config::load`], exposed so tests and embedders
    /// can layer their own providers
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("lift.toml"))
            .merge(Env::prefixed("LIFT_").split("__"))
    }
}
