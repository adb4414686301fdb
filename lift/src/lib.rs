//! # lift
//!
//! Serverless request-handling framework for functions deployed behind a
//! cloud gateway. Lift normalizes heterogeneous event sources (HTTP
//! gateways, queues, object-store notifications, event buses, schedules,
//! streams, WebSockets) into one request/response pipeline with typed
//! handlers, composable middleware, and multi-tenant request context.
//!
//! ## Features
//!
//! - **Event adapters**: shape-based detection and normalization for eight
//!   trigger types, including HTTP-v2 stage-prefix stripping
//! - **Routing**: method + path patterns with `:name` parameter capture,
//!   literal-preference tie-breaking, and proper 404/405 semantics
//! - **Middleware**: guaranteed pre/post ordering, short-circuiting, and
//!   declarative response buffering for intercepting middleware
//! - **Typed handlers**: automatic deserialize, validate, invoke, serialize
//! - **Resilience**: rate limiting, timeouts, circuit breaking, bulkheads,
//!   retries, and load shedding, all safe under concurrent invocations
//! - **Resource pools**: bounded reuse with expiry, health checks, and
//!   pre-warming across warm invocations
//! - **Health**: parallel component checks with caching and aggregation
//!
//! ## Example
//!
//! ```rust,no_run
//! use lift::prelude::*;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::load().unwrap_or_default();
//!     init_tracing(&config.runtime);
//!
//!     let mut app = Application::with_config(config.runtime.clone());
//!     app.middleware(RequestId::new())
//!         .middleware(Logger::new())
//!         .middleware(Recover::new());
//!
//!     app.get("/v1/customers/:id", handler_fn(|ctx: Context| async move {
//!         let id = ctx.param("id").unwrap_or_default().to_string();
//!         ctx.json(&json!({ "id": id }))
//!     }));
//!
//!     // The platform invokes the process once per event
//!     let raw = json!({ /* gateway payload */ });
//!     let _response = app.handle(raw).await;
//! }
//! ```

pub mod adapters;
pub mod app;
pub mod config;
pub mod context;
pub mod error;
pub mod handler;
pub mod health;
pub mod middleware;
pub mod observability;
pub mod pool;
pub mod request;
pub mod response;
pub mod router;

/// Commonly used types, re-exported for application code
pub mod prelude {
    pub use crate::adapters::{detect, EVENT_METHOD, WEBSOCKET_METHOD};
    pub use crate::app::{Application, RouteGroup};
    pub use crate::config::{Config, RuntimeConfig};
    pub use crate::context::{Context, Identity};
    pub use crate::error::{ErrorCode, LiftError, Result};
    pub use crate::handler::{handler_fn, typed_handler, Handler};
    pub use crate::health::{Health, HealthAggregator, HealthChecker, HealthConfig, HealthStatus};
    pub use crate::middleware::auth::{AuthConfig, JwtAuth};
    pub use crate::middleware::bulkhead::{Bulkhead, BulkheadConfig, BulkheadScope};
    pub use crate::middleware::cache::{CacheConfig, ResponseCache};
    pub use crate::middleware::circuit_breaker::{
        BreakerScope, BreakerState, CircuitBreaker, CircuitBreakerConfig,
    };
    pub use crate::middleware::cors::{Cors, CorsConfig};
    pub use crate::middleware::load_shed::{LoadShed, LoadShedConfig, ShedStrategy};
    pub use crate::middleware::logger::Logger;
    pub use crate::middleware::rate_limit::{KeyStrategy, RateLimit, RateLimitConfig, WindowType};
    pub use crate::middleware::recover::Recover;
    pub use crate::middleware::request_id::RequestId;
    pub use crate::middleware::retry::{BackoffStrategy, Retry, RetryConfig};
    pub use crate::middleware::timeout::Timeout;
    pub use crate::middleware::{Middleware, Next};
    pub use crate::observability::init_tracing;
    pub use crate::pool::{
        Pool, PoolConfig, PoolGuard, PoolHealthChecker, PoolResource, PoolStats, ResourceFactory,
    };
    pub use crate::request::{Request, TriggerType};
    pub use crate::response::{Body, Response};
    pub use crate::router::Router;
}
