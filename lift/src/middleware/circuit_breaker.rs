//! Circuit breaker middleware
//!
//! Tracks failures per logical service key (global, tenant-scoped, or
//! operation-scoped). Closed passes through; open short-circuits with
//! `SERVICE_UNAVAILABLE` until the open timeout elapses; half-open permits a
//! bounded probe count, closing after enough consecutive successes and
//! reopening on any failure.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::error::{LiftError, Result};
use crate::middleware::{Middleware, Next};

/// Which logical service key failures are tracked under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerScope {
    /// One breaker for the whole application
    Global,
    /// One breaker per tenant
    PerTenant,
    /// One breaker per method + path
    PerOperation,
}

/// Configuration for [`CircuitBreaker`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Seconds the circuit stays open before probing
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Error-rate threshold (0.0 - 1.0) over the sliding window
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,
    /// Minimum observations before the error rate is meaningful
    #[serde(default = "default_min_requests")]
    pub min_requests: u64,
    /// Sliding-window size in observations
    #[serde(default = "default_sliding_window")]
    pub sliding_window: usize,
    /// Key scope
    #[serde(default = "default_scope")]
    pub scope: BreakerScope,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_success_threshold() -> u32 {
    2
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_error_rate_threshold() -> f64 {
    0.5
}
fn default_min_requests() -> u64 {
    10
}
fn default_sliding_window() -> usize {
    100
}
fn default_scope() -> BreakerScope {
    BreakerScope::Global
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            timeout_secs: default_timeout_secs(),
            error_rate_threshold: default_error_rate_threshold(),
            min_requests: default_min_requests(),
            sliding_window: default_sliding_window(),
            scope: default_scope(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the consecutive-failure threshold
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set the half-open success threshold
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }

    /// Set the open timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Set the error-rate threshold over the sliding window
    pub fn with_error_rate_threshold(mut self, threshold: f64) -> Self {
        self.error_rate_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    /// Set the key scope
    pub fn with_scope(mut self, scope: BreakerScope) -> Self {
        self.scope = scope;
        self
    }
}

/// Breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Passing requests through
    Closed,
    /// Short-circuiting
    Open,
    /// Permitting a bounded probe count
    HalfOpen,
}

struct BreakerCell {
    state: BreakerState,
    consecutive_failures: u32,
    half_open_successes: u32,
    half_open_inflight: u32,
    opened_at: Option<Instant>,
    window: VecDeque<bool>,
}

impl BreakerCell {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            half_open_inflight: 0,
            opened_at: None,
            window: VecDeque::new(),
        }
    }

    fn error_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|ok| !**ok).count();
        failures as f64 / self.window.len() as f64
    }
}

/// Circuit breaker middleware with a per-key breaker registry
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    cells: DashMap<String, Mutex<BreakerCell>>,
}

impl CircuitBreaker {
    /// Breaker with the default configuration
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            cells: DashMap::new(),
        }
    }

    fn key(&self, ctx: &Context) -> String {
        match self.config.scope {
            BreakerScope::Global => "global".to_string(),
            BreakerScope::PerTenant => ctx
                .tenant_id()
                .unwrap_or_else(|| "untenanted".to_string()),
            BreakerScope::PerOperation => format!("{} {}", ctx.method(), ctx.path()),
        }
    }

    /// Current state for a key (observability surface)
    pub fn state(&self, key: &str) -> BreakerState {
        self.cells
            .get(key)
            .map(|cell| cell.lock().expect("breaker lock").state)
            .unwrap_or(BreakerState::Closed)
    }

    /// Decide whether the request may proceed; updates half-open probe counts
    fn try_acquire(&self, key: &str) -> std::result::Result<(), u64> {
        let cell = self
            .cells
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(BreakerCell::new()));
        let mut cell = cell.lock().expect("breaker lock");

        match cell.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = cell
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                let timeout = Duration::from_secs(self.config.timeout_secs);
                if elapsed >= timeout {
                    cell.state = BreakerState::HalfOpen;
                    cell.half_open_successes = 0;
                    cell.half_open_inflight = 1;
                    tracing::info!(key, "circuit breaker half-open, probing");
                    Ok(())
                } else {
                    Err((timeout - elapsed).as_secs().max(1))
                }
            }
            BreakerState::HalfOpen => {
                if cell.half_open_inflight < self.config.success_threshold {
                    cell.half_open_inflight += 1;
                    Ok(())
                } else {
                    Err(1)
                }
            }
        }
    }

    fn record(&self, key: &str, success: bool) {
        let Some(cell) = self.cells.get(key) else {
            return;
        };
        let mut cell = cell.lock().expect("breaker lock");

        if cell.window.len() >= self.config.sliding_window {
            cell.window.pop_front();
        }
        cell.window.push_back(success);

        match cell.state {
            BreakerState::Closed => {
                if success {
                    cell.consecutive_failures = 0;
                } else {
                    cell.consecutive_failures += 1;
                    let rate_tripped = cell.window.len() as u64 >= self.config.min_requests
                        && cell.error_rate() >= self.config.error_rate_threshold;
                    if cell.consecutive_failures >= self.config.failure_threshold || rate_tripped {
                        cell.state = BreakerState::Open;
                        cell.opened_at = Some(Instant::now());
                        tracing::warn!(key, "circuit breaker opened");
                    }
                }
            }
            BreakerState::HalfOpen => {
                cell.half_open_inflight = cell.half_open_inflight.saturating_sub(1);
                if success {
                    cell.half_open_successes += 1;
                    if cell.half_open_successes >= self.config.success_threshold {
                        cell.state = BreakerState::Closed;
                        cell.consecutive_failures = 0;
                        cell.window.clear();
                        cell.opened_at = None;
                        tracing::info!(key, "circuit breaker closed");
                    }
                } else {
                    cell.state = BreakerState::Open;
                    cell.opened_at = Some(Instant::now());
                    tracing::warn!(key, "circuit breaker reopened from half-open");
                }
            }
            BreakerState::Open => {}
        }
    }
}

/// Server-side failures trip the breaker; client errors do not
fn counts_as_failure(err: &LiftError) -> bool {
    err.status.as_u16() >= 500
}

#[async_trait]
impl Middleware for CircuitBreaker {
    async fn handle(&self, ctx: Context, next: Next<'_>) -> Result<()> {
        let key = self.key(&ctx);

        if let Err(retry_after) = self.try_acquire(&key) {
            ctx.set_header("retry-after", retry_after.to_string());
            return Err(LiftError::service_unavailable("circuit breaker open")
                .with_detail("retryAfterSecs", retry_after));
        }

        let result = next.run(ctx).await;
        let success = match &result {
            Ok(()) => true,
            Err(e) => !counts_as_failure(e),
        };
        self.record(&key, success);
        result
    }

    fn name(&self) -> &'static str {
        "circuit-breaker"
    }
}
