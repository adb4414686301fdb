//! Retry middleware
//!
//! Re-runs the inner chain on retryable failures with a configurable
//! backoff strategy and optional jitter. Validation, auth, and not-found
//! failures are never retried; by default only the transient HTTP statuses
//! (408, 429, 502, 503, 504) are.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::error::{ErrorCode, LiftError, Result};
use crate::middleware::{Middleware, Next};

/// Delay progression between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every attempt
    Fixed,
    /// Delay grows linearly with the attempt number
    Linear,
    /// Delay multiplies by the backoff factor each attempt
    Exponential,
}

/// Configuration for [`Retry`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Upper bound on any delay, in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Delay progression
    #[serde(default = "default_strategy")]
    pub strategy: BackoffStrategy,
    /// Multiplier for the exponential strategy
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Whether delays are jittered
    #[serde(default)]
    pub jitter: bool,
    /// Jitter range as a fraction of the delay (0.0 - 1.0)
    #[serde(default = "default_jitter_range")]
    pub jitter_range: f64,
    /// Statuses considered retryable
    #[serde(default = "default_retryable_statuses")]
    pub retryable_statuses: Vec<u16>,
    /// Statuses excluded from retry even when listed above
    #[serde(default)]
    pub non_retryable_statuses: Vec<u16>,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay_ms() -> u64 {
    100
}
fn default_max_delay_ms() -> u64 {
    10_000
}
fn default_strategy() -> BackoffStrategy {
    BackoffStrategy::Exponential
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_jitter_range() -> f64 {
    0.25
}
fn default_retryable_statuses() -> Vec<u16> {
    vec![408, 429, 502, 503, 504]
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            strategy: default_strategy(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: false,
            jitter_range: default_jitter_range(),
            retryable_statuses: default_retryable_statuses(),
            non_retryable_statuses: Vec::new(),
        }
    }
}

impl RetryConfig {
    /// Default configuration: 3 attempts, exponential backoff from 100ms
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the attempt bound
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set the delay progression
    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the initial delay
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Enable jittered delays
    pub fn with_jitter(mut self, range: f64) -> Self {
        self.jitter = true;
        self.jitter_range = range.clamp(0.0, 1.0);
        self
    }

    /// Exclude a status from retry
    pub fn with_non_retryable_status(mut self, status: u16) -> Self {
        self.non_retryable_statuses.push(status);
        self
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_delay_ms as f64;
        let raw = match self.strategy {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Linear => base * attempt as f64,
            BackoffStrategy::Exponential => {
                base * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32)
            }
        };
        let mut millis = raw.min(self.max_delay_ms as f64);
        if self.jitter && millis > 0.0 {
            let spread = millis * self.jitter_range;
            let offset = rand::thread_rng().gen_range(-spread..=spread);
            millis = (millis + offset).max(0.0);
        }
        Duration::from_millis(millis as u64)
    }

    fn is_retryable(&self, err: &LiftError) -> bool {
        // Deterministic client failures never benefit from another attempt
        if matches!(
            err.code,
            ErrorCode::ValidationError
                | ErrorCode::Unauthorized
                | ErrorCode::Forbidden
                | ErrorCode::NotFound
        ) {
            return false;
        }
        let status = err.status.as_u16();
        if self.non_retryable_statuses.contains(&status) {
            return false;
        }
        self.retryable_statuses.contains(&status)
    }
}

/// Retry middleware
#[derive(Debug, Default)]
pub struct Retry {
    config: RetryConfig,
}

impl Retry {
    /// Retry with the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Retry with a custom configuration
    pub fn with_config(config: RetryConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Middleware for Retry {
    async fn handle(&self, ctx: Context, next: Next<'_>) -> Result<()> {
        let mut attempt = 1;
        loop {
            let result = next.run(ctx.clone()).await;
            let err = match result {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };

            if attempt >= self.config.max_attempts || !self.config.is_retryable(&err) {
                return Err(err);
            }

            let delay = self.config.delay_for(attempt);
            if let Some(remaining) = ctx.remaining() {
                if delay >= remaining {
                    // Another attempt cannot complete inside the deadline
                    return Err(err);
                }
            }

            tracing::debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                code = %err.code,
                "retrying after failure"
            );
            ctx.with_response(|r| r.reset_for_retry());
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    fn name(&self) -> &'static str {
        "retry"
    }
}
