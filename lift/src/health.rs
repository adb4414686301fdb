//! Parallel health aggregation
//!
//! Registered checkers run concurrently with per-check and overall
//! timeouts; a checker that panics reports unhealthy rather than taking the
//! probe down. The aggregate is unhealthy when any required checker is,
//! degraded when any checker is degraded, healthy otherwise, and is cached
//! for a configurable TTL.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Component status levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    /// Fully operational
    Healthy,
    /// Operational with reduced capability
    Degraded,
    /// Not operational
    Unhealthy,
}

/// One component's reported status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Status level
    pub status: Health,
    /// When the check ran
    pub timestamp: DateTime<Utc>,
    /// How long the check took
    pub duration_ms: u64,
    /// Optional human-readable note
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Error text when unhealthy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Structured detail
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub details: Map<String, Value>,
}

impl HealthStatus {
    /// Healthy status with a note
    pub fn healthy(message: impl Into<String>) -> Self {
        Self {
            status: Health::Healthy,
            timestamp: Utc::now(),
            duration_ms: 0,
            message: Some(message.into()),
            error: None,
            details: Map::new(),
        }
    }

    /// Degraded status with a note
    pub fn degraded(message: impl Into<String>) -> Self {
        Self {
            status: Health::Degraded,
            timestamp: Utc::now(),
            duration_ms: 0,
            message: Some(message.into()),
            error: None,
            details: Map::new(),
        }
    }

    /// Unhealthy status with error text
    pub fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            status: Health::Unhealthy,
            timestamp: Utc::now(),
            duration_ms: 0,
            message: None,
            error: Some(error.into()),
            details: Map::new(),
        }
    }

    /// Attach a structured detail entry
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

/// A component that reports its own operational status on demand
#[async_trait]
pub trait HealthChecker: Send + Sync + 'static {
    /// Run the check
    async fn check(&self) -> HealthStatus;
}

/// Configuration for [`HealthAggregator`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Per-check timeout in milliseconds
    #[serde(default = "default_check_timeout_ms")]
    pub check_timeout_ms: u64,
    /// Cap on total probe time in milliseconds
    #[serde(default = "default_overall_timeout_ms")]
    pub overall_timeout_ms: u64,
    /// Aggregate cache lifetime in milliseconds
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
}

fn default_check_timeout_ms() -> u64 {
    2_000
}
fn default_overall_timeout_ms() -> u64 {
    5_000
}
fn default_cache_ttl_ms() -> u64 {
    1_000
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_timeout_ms: default_check_timeout_ms(),
            overall_timeout_ms: default_overall_timeout_ms(),
            cache_ttl_ms: default_cache_ttl_ms(),
        }
    }
}

struct Registration {
    name: String,
    checker: Arc<dyn HealthChecker>,
    required: bool,
}

struct CachedOverall {
    status: HealthStatus,
    at: Instant,
}

/// Aggregates component health into a single status
pub struct HealthAggregator {
    config: HealthConfig,
    checkers: Vec<Registration>,
    cache: Mutex<Option<CachedOverall>>,
}

impl HealthAggregator {
    /// Aggregator with the default timeouts
    pub fn new() -> Self {
        Self::with_config(HealthConfig::default())
    }

    /// Aggregator with custom timeouts
    pub fn with_config(config: HealthConfig) -> Self {
        Self {
            config,
            checkers: Vec::new(),
            cache: Mutex::new(None),
        }
    }

    /// Register a required checker
    pub fn register(&mut self, name: impl Into<String>, checker: Arc<dyn HealthChecker>) {
        self.register_with(name, checker, true);
    }

    /// Register a checker, marking whether it gates overall health
    pub fn register_with(
        &mut self,
        name: impl Into<String>,
        checker: Arc<dyn HealthChecker>,
        required: bool,
    ) {
        self.checkers.push(Registration {
            name: name.into(),
            checker,
            required,
        });
    }

    /// Run every checker concurrently
    pub async fn check_all(&self) -> HashMap<String, HealthStatus> {
        let per_check = Duration::from_millis(self.config.check_timeout_ms);
        let overall = Duration::from_millis(self.config.overall_timeout_ms);

        let probes = self.checkers.iter().map(|reg| {
            let checker = reg.checker.clone();
            let name = reg.name.clone();
            async move {
                let started = Instant::now();
                let outcome =
                    tokio::time::timeout(per_check, AssertUnwindSafe(checker.check()).catch_unwind())
                        .await;
                let mut status = match outcome {
                    Ok(Ok(status)) => status,
                    Ok(Err(payload)) => {
                        let text = crate::error::LiftError::from_panic(payload.as_ref()).message;
                        HealthStatus::unhealthy(format!("checker panicked: {text}"))
                    }
                    Err(_) => HealthStatus::unhealthy(format!(
                        "check exceeded {}ms timeout",
                        per_check.as_millis()
                    )),
                };
                status.duration_ms = started.elapsed().as_millis() as u64;
                (name, status)
            }
        });

        match tokio::time::timeout(overall, join_all(probes)).await {
            Ok(results) => results.into_iter().collect(),
            Err(_) => self
                .checkers
                .iter()
                .map(|reg| {
                    (
                        reg.name.clone(),
                        HealthStatus::unhealthy(format!(
                            "aggregate probe exceeded {}ms timeout",
                            overall.as_millis()
                        )),
                    )
                })
                .collect(),
        }
    }

    /// Aggregate status, served from cache while fresh
    pub async fn overall(&self) -> HealthStatus {
        let ttl = Duration::from_millis(self.config.cache_ttl_ms);
        {
            let cache = self.cache.lock().expect("health cache lock");
            if let Some(cached) = cache.as_ref() {
                if cached.at.elapsed() < ttl {
                    return cached.status.clone();
                }
            }
        }

        let started = Instant::now();
        let results = self.check_all().await;
        let status = self.aggregate(&results, started.elapsed());

        let mut cache = self.cache.lock().expect("health cache lock");
        *cache = Some(CachedOverall {
            status: status.clone(),
            at: Instant::now(),
        });
        status
    }

    fn aggregate(&self, results: &HashMap<String, HealthStatus>, took: Duration) -> HealthStatus {
        let mut overall = Health::Healthy;
        let mut failing = Vec::new();

        for reg in &self.checkers {
            let Some(status) = results.get(&reg.name) else {
                continue;
            };
            match status.status {
                Health::Unhealthy if reg.required => {
                    overall = Health::Unhealthy;
                    failing.push(reg.name.clone());
                }
                Health::Unhealthy | Health::Degraded => {
                    if overall == Health::Healthy {
                        overall = Health::Degraded;
                    }
                }
                Health::Healthy => {}
            }
        }

        let mut details = Map::new();
        for (name, status) in results {
            details.insert(
                name.clone(),
                serde_json::to_value(status).unwrap_or(Value::Null),
            );
        }

        HealthStatus {
            status: overall,
            timestamp: Utc::now(),
            duration_ms: took.as_millis() as u64,
            message: (!failing.is_empty()).then(|| format!("failing: {}", failing.join(", "))),
            error: None,
            details,
        }
    }
}

impl Default for HealthAggregator {
    fn default() -> Self {
        Self::new()
    }
}
