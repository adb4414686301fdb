//! Load shedding middleware
//!
//! Observes rolling latency and error-rate metrics (plus optional external
//! cpu/memory gauges) and, once thresholds are exceeded, probabilistically
//! rejects requests with `LOAD_SHED` before they consume capacity.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::error::{ErrorCode, LiftError, Result};
use crate::middleware::{Middleware, Next, PriorityExtractor};

/// How overload translates into rejections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShedStrategy {
    /// Reject a fixed fraction of traffic while overloaded
    Random,
    /// Reject low-priority traffic first
    Priority,
    /// Scale the rejection probability toward a target latency
    Adaptive,
}

/// Configuration for [`LoadShed`]
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadShedConfig {
    /// Rejection strategy
    pub strategy: ShedStrategy,
    /// CPU utilization threshold (0.0 - 1.0), checked against the gauge source
    pub cpu_threshold: f64,
    /// Memory utilization threshold (0.0 - 1.0)
    pub memory_threshold: f64,
    /// Mean-latency threshold in milliseconds
    pub latency_threshold_ms: u64,
    /// Error-rate threshold (0.0 - 1.0)
    pub error_rate_threshold: f64,
    /// Observations required before shedding can begin
    pub min_request_threshold: usize,
    /// Latency the adaptive strategy steers toward, in milliseconds
    pub target_latency_ms: u64,
    /// Fraction rejected by the random strategy while overloaded
    pub shed_probability: f64,
    /// Requests at or above this priority are never shed (priority strategy)
    #[serde(skip)]
    pub priority_extractor: Option<PriorityExtractor>,
    /// Priority floor for the priority strategy
    pub protected_priority: u8,
}

impl Default for LoadShedConfig {
    fn default() -> Self {
        Self {
            strategy: ShedStrategy::Adaptive,
            cpu_threshold: 0.9,
            memory_threshold: 0.9,
            latency_threshold_ms: 1_000,
            error_rate_threshold: 0.5,
            min_request_threshold: 20,
            target_latency_ms: 500,
            shed_probability: 0.5,
            priority_extractor: None,
            protected_priority: 8,
        }
    }
}

impl LoadShedConfig {
    /// Default configuration (adaptive, 1s latency threshold)
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the rejection strategy
    pub fn with_strategy(mut self, strategy: ShedStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the mean-latency threshold
    pub fn with_latency_threshold(mut self, threshold: Duration) -> Self {
        self.latency_threshold_ms = threshold.as_millis() as u64;
        self
    }

    /// Set the error-rate threshold
    pub fn with_error_rate_threshold(mut self, threshold: f64) -> Self {
        self.error_rate_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    /// Set the observation floor
    pub fn with_min_requests(mut self, min: usize) -> Self {
        self.min_request_threshold = min;
        self
    }

    /// Set the adaptive latency target
    pub fn with_target_latency(mut self, target: Duration) -> Self {
        self.target_latency_ms = target.as_millis().max(1) as u64;
        self
    }

    /// Protect high-priority traffic
    pub fn with_priority(mut self, extractor: PriorityExtractor, protected: u8) -> Self {
        self.priority_extractor = Some(extractor);
        self.protected_priority = protected;
        self
    }
}

/// External utilization gauges consulted alongside the rolling metrics
///
/// The framework does not sample the host itself; deployments wire in a
/// source backed by whatever the platform exposes.
pub trait UtilizationSource: Send + Sync + 'static {
    /// CPU utilization (0.0 - 1.0), when known
    fn cpu(&self) -> Option<f64> {
        None
    }

    /// Memory utilization (0.0 - 1.0), when known
    fn memory(&self) -> Option<f64> {
        None
    }
}

/// Gauge source reporting nothing; rolling metrics alone drive shedding
#[derive(Debug, Default)]
pub struct NoUtilization;

impl UtilizationSource for NoUtilization {}

struct Rolling {
    samples: VecDeque<(Instant, Duration, bool)>,
    window: Duration,
}

impl Rolling {
    fn new(window: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            window,
        }
    }

    fn record(&mut self, latency: Duration, ok: bool) {
        let now = Instant::now();
        self.samples.push_back((now, latency, ok));
        while let Some((at, _, _)) = self.samples.front() {
            if now.duration_since(*at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn len(&self) -> usize {
        self.samples.len()
    }

    fn mean_latency(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.samples.iter().map(|(_, d, _)| *d).sum();
        total / self.samples.len() as u32
    }

    fn error_rate(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let failures = self.samples.iter().filter(|(_, _, ok)| !ok).count();
        failures as f64 / self.samples.len() as f64
    }
}

/// Load shedding middleware
pub struct LoadShed {
    config: LoadShedConfig,
    metrics: Mutex<Rolling>,
    utilization: Arc<dyn UtilizationSource>,
}

impl LoadShed {
    /// Shedder driven by rolling metrics only
    pub fn new(config: LoadShedConfig) -> Self {
        Self::with_utilization(config, Arc::new(NoUtilization))
    }

    /// Shedder with an external utilization gauge source
    pub fn with_utilization(config: LoadShedConfig, utilization: Arc<dyn UtilizationSource>) -> Self {
        Self {
            config,
            metrics: Mutex::new(Rolling::new(Duration::from_secs(30))),
            utilization,
        }
    }

    fn overload(&self) -> Option<f64> {
        if let Some(cpu) = self.utilization.cpu() {
            if cpu >= self.config.cpu_threshold {
                return Some(1.0);
            }
        }
        if let Some(memory) = self.utilization.memory() {
            if memory >= self.config.memory_threshold {
                return Some(1.0);
            }
        }

        let metrics = self.metrics.lock().expect("metrics lock");
        if metrics.len() < self.config.min_request_threshold {
            return None;
        }
        let mean_ms = metrics.mean_latency().as_millis() as u64;
        if mean_ms >= self.config.latency_threshold_ms {
            // Ratio above target drives the adaptive probability
            let target = self.config.target_latency_ms as f64;
            return Some(((mean_ms as f64 - target) / target).clamp(0.0, 1.0));
        }
        if metrics.error_rate() >= self.config.error_rate_threshold {
            return Some(metrics.error_rate());
        }
        None
    }

    fn should_shed(&self, ctx: &Context, overload: f64) -> bool {
        match self.config.strategy {
            ShedStrategy::Random => {
                rand::thread_rng().gen_bool(self.config.shed_probability.clamp(0.0, 1.0))
            }
            ShedStrategy::Adaptive => rand::thread_rng().gen_bool(overload.clamp(0.05, 1.0)),
            ShedStrategy::Priority => {
                let priority = self
                    .config
                    .priority_extractor
                    .as_ref()
                    .map(|extract| extract(ctx))
                    .unwrap_or(0);
                priority < self.config.protected_priority
            }
        }
    }
}

#[async_trait]
impl Middleware for LoadShed {
    async fn handle(&self, ctx: Context, next: Next<'_>) -> Result<()> {
        if let Some(overload) = self.overload() {
            if self.should_shed(&ctx, overload) {
                return Err(LiftError::new(
                    ErrorCode::LoadShed,
                    "request shed under load",
                ));
            }
        }

        let started = Instant::now();
        let result = next.run(ctx).await;
        let ok = match &result {
            Ok(()) => true,
            Err(e) => e.status.as_u16() < 500,
        };
        self.metrics
            .lock()
            .expect("metrics lock")
            .record(started.elapsed(), ok);
        result
    }

    fn name(&self) -> &'static str {
        "load-shed"
    }
}
