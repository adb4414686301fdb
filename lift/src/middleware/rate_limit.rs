//! Rate limiting middleware
//!
//! Keys each request through a configured strategy and consults a bounded
//! counter over a fixed or sliding window (or several windows at once). On
//! breach the request fails with `RATE_LIMIT_EXCEEDED`, `Retry-After`, and
//! `X-RateLimit-*` headers. A failing store fails open: the request is
//! allowed and a warning is logged.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::Context;
use crate::error::{LiftError, Result};
use crate::middleware::{Middleware, Next};

/// How requests are bucketed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// Source address (forwarded-for header, falling back to gateway metadata)
    Ip,
    /// Authenticated user id
    User,
    /// Tenant id
    Tenant,
    /// Method and path
    Endpoint,
    /// Concatenation of several strategies
    Composite(Vec<KeyStrategy>),
}

impl KeyStrategy {
    fn extract(&self, ctx: &Context) -> String {
        match self {
            Self::Ip => client_ip(ctx).unwrap_or_else(|| "unknown".to_string()),
            Self::User => ctx.user_id().unwrap_or_else(|| "anonymous".to_string()),
            Self::Tenant => ctx.tenant_id().unwrap_or_else(|| "untenanted".to_string()),
            Self::Endpoint => format!("{} {}", ctx.method(), ctx.path()),
            Self::Composite(parts) => parts
                .iter()
                .map(|p| p.extract(ctx))
                .collect::<Vec<_>>()
                .join("|"),
        }
    }
}

fn client_ip(ctx: &Context) -> Option<String> {
    if let Some(forwarded) = ctx.header("x-forwarded-for") {
        return forwarded.split(',').next().map(|ip| ip.trim().to_string());
    }
    ctx.request()
        .metadata_value("http")
        .and_then(|h| h.get("sourceIp"))
        .or_else(|| {
            ctx.request()
                .metadata_value("identity")
                .and_then(|i| i.get("sourceIp"))
        })
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Counting mode for a window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowType {
    /// Counter resets at window boundaries
    Fixed,
    /// Counter covers the trailing window
    Sliding,
}

/// One (window, limit) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateWindow {
    /// Window length in seconds
    pub window_secs: u64,
    /// Requests permitted within the window
    pub limit: u64,
}

/// Configuration for [`RateLimit`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Counting mode
    #[serde(default = "default_window_type")]
    pub window_type: WindowType,
    /// Window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Requests permitted within the window
    #[serde(default = "default_limit")]
    pub limit: u64,
    /// Additional windows enforced simultaneously (multi-window mode)
    #[serde(default)]
    pub extra_windows: Vec<RateWindow>,
    /// Key strategy
    #[serde(default = "default_key_strategy")]
    pub key_strategy: KeyStrategy,
}

fn default_window_type() -> WindowType {
    WindowType::Fixed
}
fn default_window_secs() -> u64 {
    60
}
fn default_limit() -> u64 {
    100
}
fn default_key_strategy() -> KeyStrategy {
    KeyStrategy::Ip
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_type: default_window_type(),
            window_secs: default_window_secs(),
            limit: default_limit(),
            extra_windows: Vec::new(),
            key_strategy: default_key_strategy(),
        }
    }
}

impl RateLimitConfig {
    /// Default configuration: 100 requests per minute per source address
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the primary window and limit
    pub fn with_limit(mut self, limit: u64, window: Duration) -> Self {
        self.limit = limit;
        self.window_secs = window.as_secs().max(1);
        self
    }

    /// Use sliding-window counting
    pub fn with_sliding_window(mut self) -> Self {
        self.window_type = WindowType::Sliding;
        self
    }

    /// Enforce an additional window simultaneously
    pub fn with_extra_window(mut self, limit: u64, window: Duration) -> Self {
        self.extra_windows.push(RateWindow {
            window_secs: window.as_secs().max(1),
            limit,
        });
        self
    }

    /// Set the key strategy
    pub fn with_key_strategy(mut self, strategy: KeyStrategy) -> Self {
        self.key_strategy = strategy;
        self
    }
}

/// Outcome of consulting the store for one window
#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    /// Whether the request fits the window
    pub allowed: bool,
    /// Requests left in the window after this one
    pub remaining: u64,
    /// Seconds until the window has room again
    pub retry_after_secs: u64,
}

/// Backing store for window counters
///
/// Store failures must surface as `Err`; the middleware fails open on them.
pub trait RateLimitStore: Send + Sync + 'static {
    /// Record a hit against `key` and decide whether it fits the window
    fn check(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        window_type: WindowType,
    ) -> Result<RateDecision>;
}

enum Counter {
    Fixed { window_start: Instant, count: u64 },
    Sliding { hits: VecDeque<Instant> },
}

/// Process-local store backed by a concurrent map
#[derive(Default)]
pub struct InMemoryRateLimitStore {
    buckets: DashMap<String, Counter>,
}

impl InMemoryRateLimitStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl RateLimitStore for InMemoryRateLimitStore {
    fn check(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        window_type: WindowType,
    ) -> Result<RateDecision> {
        let now = Instant::now();
        let mut entry = self.buckets.entry(key.to_string()).or_insert_with(|| {
            match window_type {
                WindowType::Fixed => Counter::Fixed {
                    window_start: now,
                    count: 0,
                },
                WindowType::Sliding => Counter::Sliding {
                    hits: VecDeque::new(),
                },
            }
        });

        match entry.value_mut() {
            Counter::Fixed { window_start, count } => {
                if now.duration_since(*window_start) >= window {
                    *window_start = now;
                    *count = 0;
                }
                *count += 1;
                let allowed = *count <= limit;
                let elapsed = now.duration_since(*window_start);
                Ok(RateDecision {
                    allowed,
                    remaining: limit.saturating_sub(*count),
                    retry_after_secs: window.saturating_sub(elapsed).as_secs().max(1),
                })
            }
            Counter::Sliding { hits } => {
                while let Some(front) = hits.front() {
                    if now.duration_since(*front) >= window {
                        hits.pop_front();
                    } else {
                        break;
                    }
                }
                hits.push_back(now);
                let count = hits.len() as u64;
                let allowed = count <= limit;
                let retry_after = hits
                    .front()
                    .map(|oldest| window.saturating_sub(now.duration_since(*oldest)))
                    .unwrap_or(Duration::ZERO);
                Ok(RateDecision {
                    allowed,
                    remaining: limit.saturating_sub(count),
                    retry_after_secs: retry_after.as_secs().max(1),
                })
            }
        }
    }
}

/// Rate limiting middleware
pub struct RateLimit {
    config: RateLimitConfig,
    store: Arc<dyn RateLimitStore>,
}

impl RateLimit {
    /// Rate limit with the in-memory store
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_store(config, Arc::new(InMemoryRateLimitStore::new()))
    }

    /// Rate limit with a custom backing store
    pub fn with_store(config: RateLimitConfig, store: Arc<dyn RateLimitStore>) -> Self {
        Self { config, store }
    }

    fn windows(&self) -> Vec<RateWindow> {
        let mut windows = vec![RateWindow {
            window_secs: self.config.window_secs,
            limit: self.config.limit,
        }];
        windows.extend(self.config.extra_windows.iter().cloned());
        windows
    }
}

#[async_trait]
impl Middleware for RateLimit {
    async fn handle(&self, ctx: Context, next: Next<'_>) -> Result<()> {
        let key = self.config.key_strategy.extract(&ctx);

        let mut tightest: Option<RateDecision> = None;
        let mut breached: Option<(RateDecision, u64)> = None;

        for window in self.windows() {
            let scoped_key = format!("{key}:{}", window.window_secs);
            match self.store.check(
                &scoped_key,
                window.limit,
                Duration::from_secs(window.window_secs),
                self.config.window_type,
            ) {
                Ok(decision) => {
                    if !decision.allowed
                        && breached.map_or(true, |(b, _)| decision.retry_after_secs > b.retry_after_secs)
                    {
                        breached = Some((decision, window.limit));
                    }
                    if tightest.map_or(true, |t| decision.remaining < t.remaining) {
                        tightest = Some(decision);
                    }
                }
                Err(e) => {
                    // Backing-store trouble must not take the service down
                    tracing::warn!(error = %e, key = %scoped_key, "rate-limit store failed; allowing request");
                }
            }
        }

        if let Some((decision, limit)) = breached {
            ctx.set_header("retry-after", decision.retry_after_secs.to_string());
            ctx.set_header("x-ratelimit-limit", limit.to_string());
            ctx.set_header("x-ratelimit-remaining", "0");
            return Err(LiftError::rate_limited("rate limit exceeded")
                .with_detail("retryAfterSecs", decision.retry_after_secs));
        }

        if let Some(decision) = tightest {
            ctx.set_header("x-ratelimit-limit", self.config.limit.to_string());
            ctx.set_header("x-ratelimit-remaining", decision.remaining.to_string());
        }

        next.run(ctx).await
    }

    fn name(&self) -> &'static str {
        "rate-limit"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{handler_fn, Handler};
    use crate::request::{Request, TriggerType};

    fn ctx() -> Context {
        let mut req = Request::new("GET", "/x", TriggerType::HttpV2);
        let mut headers = std::collections::HashMap::new();
        headers.insert("x-forwarded-for".to_string(), "10.0.0.1".to_string());
        req.set_headers(headers);
        Context::new(req, None)
    }

    fn noop() -> Arc<dyn Handler> {
        Arc::new(handler_fn(|_ctx| async { Ok(()) }))
    }

    #[tokio::test]
    async fn test_allows_within_limit() {
        let mw: Vec<Arc<dyn Middleware>> = vec![Arc::new(RateLimit::new(
            RateLimitConfig::new().with_limit(2, Duration::from_secs(60)),
        ))];
        let handler = noop();

        for _ in 0..2 {
            Next::new(&mw, &handler).run(ctx()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_breach_yields_429_with_headers() {
        let mw: Vec<Arc<dyn Middleware>> = vec![Arc::new(RateLimit::new(
            RateLimitConfig::new().with_limit(1, Duration::from_secs(60)),
        ))];
        let handler = noop();

        Next::new(&mw, &handler).run(ctx()).await.unwrap();

        let c = ctx();
        let err = Next::new(&mw, &handler).run(c.clone()).await.unwrap_err();
        assert_eq!(err.code.as_str(), "RATE_LIMIT_EXCEEDED");
        assert_eq!(err.status.as_u16(), 429);

        let resp = c.response_snapshot();
        let retry_after: u64 = resp.header("retry-after").unwrap().parse().unwrap();
        assert!(retry_after <= 60);
        assert_eq!(resp.header("x-ratelimit-remaining"), Some("0"));
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let mw: Vec<Arc<dyn Middleware>> = vec![Arc::new(RateLimit::new(
            RateLimitConfig::new()
                .with_limit(1, Duration::from_secs(60))
                .with_key_strategy(KeyStrategy::User),
        ))];
        let handler = noop();

        let alice = ctx();
        alice.set_identity(crate::context::Identity {
            user_id: Some("alice".into()),
            ..Default::default()
        });
        let bob = ctx();
        bob.set_identity(crate::context::Identity {
            user_id: Some("bob".into()),
            ..Default::default()
        });

        Next::new(&mw, &handler).run(alice).await.unwrap();
        Next::new(&mw, &handler).run(bob).await.unwrap();
    }

    #[tokio::test]
    async fn test_store_error_fails_open() {
        struct BrokenStore;
        impl RateLimitStore for BrokenStore {
            fn check(&self, _: &str, _: u64, _: Duration, _: WindowType) -> Result<RateDecision> {
                Err(LiftError::internal("store offline"))
            }
        }

        let mw: Vec<Arc<dyn Middleware>> = vec![Arc::new(RateLimit::with_store(
            RateLimitConfig::new().with_limit(0, Duration::from_secs(60)),
            Arc::new(BrokenStore),
        ))];
        let handler = noop();

        Next::new(&mw, &handler).run(ctx()).await.unwrap();
    }

    #[test]
    fn test_composite_key() {
        let c = ctx();
        c.set_identity(crate::context::Identity {
            tenant_id: Some("t-1".into()),
            ..Default::default()
        });
        let key = KeyStrategy::Composite(vec![KeyStrategy::Tenant, KeyStrategy::Endpoint])
            .extract(&c);
        assert_eq!(key, "t-1|GET /x");
    }

    #[test]
    fn test_sliding_window_counts_trailing() {
        let store = InMemoryRateLimitStore::new();
        for _ in 0..3 {
            store
                .check("k", 3, Duration::from_secs(60), WindowType::Sliding)
                .unwrap();
        }
        let decision = store
            .check("k", 3, Duration::from_secs(60), WindowType::Sliding)
            .unwrap();
        assert!(!decision.allowed);
        assert!(decision.retry_after_secs <= 60);
    }
}
