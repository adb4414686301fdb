//! Application runtime
//!
//! One [`Application`] serves a function's whole lifetime; [`Application::handle`]
//! runs once per invocation. Each invocation selects an adapter, normalizes
//! the event, resolves the route, composes the effective middleware chain
//! (application-level, then group, then route-specific), executes it, maps
//! errors to transport responses, and encodes the result for the trigger.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::{json, Map, Value};

use crate::adapters;
use crate::config::RuntimeConfig;
use crate::context::Context;
use crate::error::{ErrorCode, LiftError, Result};
use crate::handler::Handler;
use crate::middleware::{chain_buffers, Middleware, Next};
use crate::request::{Request, TriggerType};
use crate::response::{Body, Response};
use crate::router::Router;

/// The framework entry point
pub struct Application {
    router: Router,
    middleware: Vec<Arc<dyn Middleware>>,
    config: RuntimeConfig,
}

impl Default for Application {
    fn default() -> Self {
        Self::new()
    }
}

impl Application {
    /// Application with the default runtime configuration
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Application with a custom runtime configuration
    pub fn with_config(config: RuntimeConfig) -> Self {
        Self {
            router: Router::new(),
            middleware: Vec::new(),
            config,
        }
    }

    /// Runtime configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Append an application-level middleware; pre-logic runs in
    /// registration order
    pub fn middleware(&mut self, middleware: impl Middleware) -> &mut Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Register a route
    pub fn route(&mut self, method: &str, pattern: &str, handler: impl Handler) -> &mut Self {
        self.router
            .register(method, pattern, Arc::new(handler), Vec::new());
        self
    }

    /// Register a route with route-specific middleware
    pub fn route_with(
        &mut self,
        method: &str,
        pattern: &str,
        middleware: Vec<Arc<dyn Middleware>>,
        handler: impl Handler,
    ) -> &mut Self {
        self.router
            .register(method, pattern, Arc::new(handler), middleware);
        self
    }

    /// Register a GET route
    pub fn get(&mut self, pattern: &str, handler: impl Handler) -> &mut Self {
        self.route("GET", pattern, handler)
    }

    /// Register a POST route
    pub fn post(&mut self, pattern: &str, handler: impl Handler) -> &mut Self {
        self.route("POST", pattern, handler)
    }

    /// Register a PUT route
    pub fn put(&mut self, pattern: &str, handler: impl Handler) -> &mut Self {
        self.route("PUT", pattern, handler)
    }

    /// Register a PATCH route
    pub fn patch(&mut self, pattern: &str, handler: impl Handler) -> &mut Self {
        self.route("PATCH", pattern, handler)
    }

    /// Register a DELETE route
    pub fn delete(&mut self, pattern: &str, handler: impl Handler) -> &mut Self {
        self.route("DELETE", pattern, handler)
    }

    /// Register a WebSocket route by its route key (`$connect`,
    /// `$disconnect`, `$default`, or a custom route)
    pub fn websocket(&mut self, route_key: &str, handler: impl Handler) -> &mut Self {
        let pattern = format!("/{route_key}");
        self.route(adapters::WEBSOCKET_METHOD, &pattern, handler)
    }

    /// Register a handler for a non-HTTP event path (queue name, bus
    /// source, schedule rule, object bucket/key pattern)
    pub fn on_event(&mut self, pattern: &str, handler: impl Handler) -> &mut Self {
        self.route(adapters::EVENT_METHOD, pattern, handler)
    }

    /// Register a handler for a queue by name
    pub fn on_queue(&mut self, queue: &str, handler: impl Handler) -> &mut Self {
        let pattern = format!("/{queue}");
        self.on_event(&pattern, handler)
    }

    /// Register a handler for an event-bus source
    pub fn on_event_source(&mut self, source: &str, handler: impl Handler) -> &mut Self {
        let pattern = format!("/{source}");
        self.on_event(&pattern, handler)
    }

    /// Register a handler for a schedule rule
    pub fn on_schedule(&mut self, rule: &str, handler: impl Handler) -> &mut Self {
        let pattern = format!("/{rule}");
        self.on_event(&pattern, handler)
    }

    /// Open a route group under a path prefix
    pub fn group(&mut self, prefix: &str) -> RouteGroup<'_> {
        RouteGroup {
            app: self,
            prefix: prefix.to_string(),
            middleware: Vec::new(),
        }
    }

    /// Registered route count
    pub fn routes(&self) -> usize {
        self.router.len()
    }

    /// Process one raw platform event
    pub async fn handle(&self, raw: Value) -> Value {
        self.handle_with_deadline(raw, None).await
    }

    /// Process an unparsed event payload
    ///
    /// Malformed JSON fails with `BAD_REQUEST` before any adapter runs.
    pub async fn handle_raw(&self, raw: &[u8]) -> Value {
        match serde_json::from_slice(raw) {
            Ok(value) => self.handle(value).await,
            Err(e) => encode_error_http(&LiftError::bad_request(format!(
                "malformed event payload: {e}"
            ))),
        }
    }

    /// Process one raw platform event under an explicit platform deadline
    pub async fn handle_with_deadline(&self, raw: Value, deadline: Option<Instant>) -> Value {
        let deadline =
            deadline.or_else(|| Some(Instant::now() + self.config.timeout()));

        let request = match adapters::adapt(raw) {
            Ok(request) => request,
            Err(err) => {
                // Without a normalized request there is no trigger to encode
                // for; the gateway shape is the one callers can interpret
                return encode_error_http(&err);
            }
        };

        if request.body().len() > self.config.max_request_size {
            let err = LiftError::bad_request(format!(
                "request body exceeds {} bytes",
                self.config.max_request_size
            ));
            return self.finish_early(request, err, deadline);
        }

        let trigger = request.trigger();
        let (ctx, chain, handler) = self.compose(request, deadline);

        let outcome = AssertUnwindSafe(Next::new(&chain, &handler).run(ctx.clone()))
            .catch_unwind()
            .await;
        let result = match outcome {
            Ok(result) => result,
            Err(payload) => Err(self.panic_error(payload.as_ref())),
        };

        if let Err(err) = result {
            self.apply_error(&ctx, &err);
        }

        let too_large = ctx.with_response(|resp| {
            resp.body().len() > self.config.max_response_size
        });
        if too_large {
            let err = LiftError::internal("response exceeds maximum size");
            tracing::error!(
                max_bytes = self.config.max_response_size,
                "response exceeded configured size bound"
            );
            self.apply_error(&ctx, &err);
        }

        ctx.with_response(|resp| resp.flush());
        encode_response(&ctx.response_snapshot(), trigger)
    }

    /// Compose the effective chain for a normalized request
    fn compose(
        &self,
        mut request: Request,
        deadline: Option<Instant>,
    ) -> (Context, Vec<Arc<dyn Middleware>>, Arc<dyn Handler>) {
        let mut chain: Vec<Arc<dyn Middleware>> = self.middleware.clone();
        if self.config.require_tenant_id {
            chain.push(Arc::new(TenantGuard));
        }

        let handler: Arc<dyn Handler> = match self.router.find(request.method(), request.path()) {
            Ok(found) => {
                chain.extend(found.middleware.iter().cloned());
                let handler = found.handler.clone();
                request.bind_params(found.params);
                handler
            }
            Err(route_err) => Arc::new(RouteErrorHandler(Mutex::new(Some(route_err)))),
        };

        let ctx = Context::new(request, deadline);
        if chain_buffers(&chain) {
            ctx.with_response(|resp| resp.set_buffered(true));
        }
        (ctx, chain, handler)
    }

    /// Error response for failures that occur before a chain exists
    fn finish_early(&self, request: Request, err: LiftError, deadline: Option<Instant>) -> Value {
        let trigger = request.trigger();
        let ctx = Context::new(request, deadline);
        self.apply_error(&ctx, &err);
        ctx.with_response(|resp| resp.flush());
        encode_response(&ctx.response_snapshot(), trigger)
    }

    fn apply_error(&self, ctx: &Context, err: &LiftError) {
        if err.status.as_u16() >= 500 {
            tracing::error!(
                code = %err.code,
                cause = err.cause.as_ref().map(|c| c.to_string()).unwrap_or_default(),
                "{}", err.message
            );
        }
        if err.code == ErrorCode::MethodNotAllowed {
            if let Some(allow) = err.details.get("allow").and_then(Value::as_str) {
                ctx.set_header("allow", allow);
            }
        }
        ctx.write_error(err);
    }

    fn panic_error(&self, payload: &(dyn std::any::Any + Send)) -> LiftError {
        let err = LiftError::from_panic(payload);
        let backtrace = std::backtrace::Backtrace::force_capture().to_string();
        tracing::error!(panic = %err.message, %backtrace, "invocation panicked");
        if self.config.is_development() {
            LiftError::internal(err.message.clone())
                .with_detail("panic", err.message)
                .with_detail("stack", backtrace)
        } else {
            err
        }
    }
}

/// Rejects requests that reach the handler without a tenant identity
struct TenantGuard;

#[async_trait]
impl Middleware for TenantGuard {
    async fn handle(&self, ctx: Context, next: Next<'_>) -> Result<()> {
        if ctx.tenant_id().is_none() {
            return Err(LiftError::bad_request("tenant id is required"));
        }
        next.run(ctx).await
    }

    fn name(&self) -> &'static str {
        "tenant-guard"
    }
}

/// Terminal handler standing in for an unmatched route
struct RouteErrorHandler(Mutex<Option<LiftError>>);

#[async_trait]
impl Handler for RouteErrorHandler {
    async fn call(&self, _ctx: Context) -> Result<()> {
        Err(self
            .0
            .lock()
            .expect("route error lock")
            .take()
            .unwrap_or_else(|| LiftError::not_found("no matching route")))
    }
}

/// Routes registered under a shared prefix and middleware list
///
/// A group's effective middleware is its parent's list followed by its own;
/// routes inherit both the prefix and the list.
pub struct RouteGroup<'a> {
    app: &'a mut Application,
    prefix: String,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl RouteGroup<'_> {
    /// Append a group-level middleware
    pub fn middleware(mut self, middleware: impl Middleware) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Register a route under the group's prefix
    pub fn route(&mut self, method: &str, pattern: &str, handler: impl Handler) -> &mut Self {
        let full = join_paths(&self.prefix, pattern);
        self.app
            .router
            .register(method, &full, Arc::new(handler), self.middleware.clone());
        self
    }

    /// Register a GET route
    pub fn get(&mut self, pattern: &str, handler: impl Handler) -> &mut Self {
        self.route("GET", pattern, handler)
    }

    /// Register a POST route
    pub fn post(&mut self, pattern: &str, handler: impl Handler) -> &mut Self {
        self.route("POST", pattern, handler)
    }

    /// Register a PUT route
    pub fn put(&mut self, pattern: &str, handler: impl Handler) -> &mut Self {
        self.route("PUT", pattern, handler)
    }

    /// Register a DELETE route
    pub fn delete(&mut self, pattern: &str, handler: impl Handler) -> &mut Self {
        self.route("DELETE", pattern, handler)
    }

    /// Open a nested group; the child inherits this group's prefix and
    /// middleware
    pub fn group(&mut self, prefix: &str) -> RouteGroup<'_> {
        RouteGroup {
            prefix: join_paths(&self.prefix, prefix),
            middleware: self.middleware.clone(),
            app: self.app,
        }
    }
}

fn join_paths(prefix: &str, pattern: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let pattern = pattern.trim_start_matches('/');
    if pattern.is_empty() {
        prefix.to_string()
    } else {
        format!("{prefix}/{pattern}")
    }
}

/// Encode a response for the trigger that produced the request
fn encode_response(response: &Response, trigger: TriggerType) -> Value {
    if trigger.is_http() {
        let mut headers = Map::new();
        for (name, value) in response.headers() {
            headers.insert(name.clone(), Value::String(value.clone()));
        }
        if !headers.contains_key("content-type") {
            if let Some(content_type) = default_content_type(response.body()) {
                headers.insert("content-type".into(), Value::String(content_type.into()));
            }
        }
        json!({
            "statusCode": response.status().as_u16(),
            "headers": Value::Object(headers),
            "body": response.body().to_wire_string(),
            "isBase64Encoded": response.body().is_base64(),
        })
    } else {
        match response.body() {
            Body::Empty => Value::Null,
            Body::Json(v) => v.clone(),
            Body::Text(s) => Value::String(s.clone()),
            Body::Binary(_) => Value::String(response.body().to_wire_string()),
        }
    }
}

fn default_content_type(body: &Body) -> Option<&'static str> {
    match body {
        Body::Empty => None,
        Body::Json(_) => Some("application/json"),
        Body::Text(_) => Some("text/plain"),
        Body::Binary(_) => Some("application/octet-stream"),
    }
}

/// Encode an error in the gateway shape when no trigger is known
fn encode_error_http(err: &LiftError) -> Value {
    json!({
        "statusCode": err.status.as_u16(),
        "headers": { "content-type": "application/json" },
        "body": err.body().to_string(),
        "isBase64Encoded": false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;

    fn v2_event(method: &str, path: &str) -> Value {
        json!({
            "version": "2.0",
            "rawPath": path,
            "headers": {},
            "requestContext": { "http": { "method": method, "path": path }, "stage": "$default" }
        })
    }

    #[tokio::test]
    async fn test_happy_path_dispatch() {
        let mut app = Application::new();
        app.get(
            "/v1/customers/:id",
            handler_fn(|ctx: Context| async move {
                let id = ctx.param("id").unwrap_or_default().to_string();
                ctx.json(&json!({ "id": id }))
            }),
        );

        let out = app.handle(v2_event("GET", "/v1/customers/abc")).await;
        assert_eq!(out["statusCode"], 200);
        assert_eq!(out["headers"]["content-type"], "application/json");
        assert_eq!(out["body"], r#"{"id":"abc"}"#);
        assert_eq!(out["isBase64Encoded"], false);
    }

    #[tokio::test]
    async fn test_not_found_and_method_not_allowed() {
        let mut app = Application::new();
        app.get("/items", handler_fn(|ctx: Context| async move { ctx.json(&json!([])) }));

        let out = app.handle(v2_event("GET", "/missing")).await;
        assert_eq!(out["statusCode"], 404);
        let body: Value = serde_json::from_str(out["body"].as_str().unwrap()).unwrap();
        assert_eq!(body["code"], "NOT_FOUND");

        let out = app.handle(v2_event("DELETE", "/items")).await;
        assert_eq!(out["statusCode"], 405);
        assert_eq!(out["headers"]["allow"], "GET");
    }

    #[tokio::test]
    async fn test_malformed_payload_is_bad_request() {
        let app = Application::new();
        let out = app.handle_raw(b"{not json").await;
        assert_eq!(out["statusCode"], 400);
        let body: Value = serde_json::from_str(out["body"].as_str().unwrap()).unwrap();
        assert_eq!(body["code"], "BAD_REQUEST");
    }

    #[tokio::test]
    async fn test_unknown_event_shape() {
        let app = Application::new();
        let out = app.handle(json!({ "surprise": true })).await;
        assert_eq!(out["statusCode"], 400);
        let body: Value = serde_json::from_str(out["body"].as_str().unwrap()).unwrap();
        assert_eq!(body["code"], "UNSUPPORTED_EVENT");
    }

    #[tokio::test]
    async fn test_lift_error_maps_to_status_and_body() {
        let mut app = Application::new();
        app.get(
            "/conflict",
            handler_fn(|_ctx| async {
                Err(LiftError::conflict("already exists").with_detail("id", "x-1"))
            }),
        );

        let out = app.handle(v2_event("GET", "/conflict")).await;
        assert_eq!(out["statusCode"], 409);
        let body: Value = serde_json::from_str(out["body"].as_str().unwrap()).unwrap();
        assert_eq!(body["code"], "CONFLICT");
        assert_eq!(body["message"], "already exists");
        assert_eq!(body["details"]["id"], "x-1");
    }

    #[tokio::test]
    async fn test_panic_yields_sanitized_500() {
        let mut app = Application::new();
        app.get("/boom", handler_fn(|_ctx| async { panic!("secret detail") }));

        let out = app.handle(v2_event("GET", "/boom")).await;
        assert_eq!(out["statusCode"], 500);
        assert_eq!(out["body"], r#"{"error":"Internal server error"}"#);
    }

    #[tokio::test]
    async fn test_panic_in_development_carries_detail() {
        let mut app =
            Application::with_config(RuntimeConfig::new().with_environment("dev"));
        app.get("/boom", handler_fn(|_ctx| async { panic!("dev detail") }));

        let out = app.handle(v2_event("GET", "/boom")).await;
        assert_eq!(out["statusCode"], 500);
        let body: Value = serde_json::from_str(out["body"].as_str().unwrap()).unwrap();
        assert_eq!(body["details"]["panic"], "dev detail");
    }

    #[tokio::test]
    async fn test_group_prefix_and_middleware_order() {
        use crate::middleware::Middleware;
        use std::sync::Mutex as StdMutex;

        struct Mark(&'static str, Arc<StdMutex<Vec<String>>>);

        #[async_trait]
        impl Middleware for Mark {
            async fn handle(&self, ctx: Context, next: Next<'_>) -> Result<()> {
                self.1.lock().unwrap().push(format!("{}-pre", self.0));
                let r = next.run(ctx).await;
                self.1.lock().unwrap().push(format!("{}-post", self.0));
                r
            }
        }

        let log = Arc::new(StdMutex::new(Vec::new()));
        let mut app = Application::new();
        app.middleware(Mark("app", log.clone()));
        {
            let mut group = app.group("/v1").middleware(Mark("group", log.clone()));
            group.get("/ping", handler_fn(|ctx: Context| async move { ctx.text("pong") }));
        }

        let out = app.handle(v2_event("GET", "/v1/ping")).await;
        assert_eq!(out["statusCode"], 200);
        assert_eq!(out["body"], "pong");
        assert_eq!(
            *log.lock().unwrap(),
            vec!["app-pre", "group-pre", "group-post", "app-post"]
        );
    }

    #[tokio::test]
    async fn test_nested_group_prefixes() {
        let mut app = Application::new();
        {
            let mut v1 = app.group("/v1");
            let mut admin = v1.group("/admin");
            admin.get("/stats", handler_fn(|ctx: Context| async move {
                ctx.json(&json!({ "ok": true }))
            }));
        }
        let out = app.handle(v2_event("GET", "/v1/admin/stats")).await;
        assert_eq!(out["statusCode"], 200);
    }

    #[tokio::test]
    async fn test_request_size_limit() {
        let mut app = Application::with_config(
            RuntimeConfig::new().with_max_request_size(8),
        );
        app.post("/upload", handler_fn(|ctx: Context| async move { ctx.text("ok") }));

        let mut event = v2_event("POST", "/upload");
        event["body"] = Value::String("far more than eight bytes".into());
        let out = app.handle(event).await;
        assert_eq!(out["statusCode"], 400);
    }

    #[tokio::test]
    async fn test_response_size_limit() {
        let mut app = Application::with_config(
            RuntimeConfig::new().with_max_response_size(8),
        );
        app.get("/big", handler_fn(|ctx: Context| async move {
            ctx.text("a very large response body")
        }));

        let out = app.handle(v2_event("GET", "/big")).await;
        assert_eq!(out["statusCode"], 500);
    }

    #[tokio::test]
    async fn test_require_tenant_id() {
        let mut app = Application::with_config(
            RuntimeConfig::new().with_require_tenant_id(true),
        );
        app.get("/data", handler_fn(|ctx: Context| async move { ctx.text("ok") }));

        let out = app.handle(v2_event("GET", "/data")).await;
        assert_eq!(out["statusCode"], 400);
    }

    #[tokio::test]
    async fn test_event_trigger_returns_body_value() {
        let mut app = Application::new();
        app.on_event_source(
            "my.app.orders",
            handler_fn(|ctx: Context| async move {
                ctx.json(&json!({ "accepted": true }))
            }),
        );

        let event = json!({
            "version": "0",
            "id": "e-1",
            "detail-type": "order.created",
            "source": "my.app.orders",
            "detail": { "orderId": "o-1" }
        });
        let out = app.handle(event).await;
        assert_eq!(out, json!({ "accepted": true }));
    }

    #[tokio::test]
    async fn test_stage_prefix_invisible_to_routes() {
        let mut app = Application::new();
        app.get(
            "/v1/customers/:id",
            handler_fn(|ctx: Context| async move {
                let id = ctx.param("id").unwrap_or_default().to_string();
                ctx.json(&json!({ "id": id }))
            }),
        );

        let event = json!({
            "version": "2.0",
            "rawPath": "/paytheorystudy/v1/customers/abc",
            "headers": {},
            "requestContext": {
                "http": { "method": "GET", "path": "/paytheorystudy/v1/customers/abc" },
                "stage": "paytheorystudy"
            }
        });
        let out = app.handle(event).await;
        assert_eq!(out["statusCode"], 200);
        assert_eq!(out["headers"]["content-type"], "application/json");
        assert_eq!(out["body"], r#"{"id":"abc"}"#);
    }

    #[tokio::test]
    async fn test_typed_handler_validation_through_pipeline() {
        use crate::handler::typed_handler;
        use serde::{Deserialize, Serialize};

        #[derive(Debug, Deserialize, garde::Validate)]
        struct CreateUser {
            #[garde(required)]
            name: Option<String>,
            #[garde(range(min = 0, max = 120))]
            #[serde(default)]
            age: i64,
        }

        #[derive(Serialize)]
        struct Created {
            id: String,
        }

        let mut app = Application::new();
        app.post(
            "/users",
            typed_handler(|_ctx: Context, user: CreateUser| async move {
                Ok(Created {
                    id: format!("u-{}", user.name.unwrap_or_default()),
                })
            }),
        );

        let mut event = v2_event("POST", "/users");
        event["body"] = Value::String(r#"{"age":-1}"#.into());
        let out = app.handle(event).await;

        assert_eq!(out["statusCode"], 422);
        let body: Value = serde_json::from_str(out["body"].as_str().unwrap()).unwrap();
        assert_eq!(body["code"], "VALIDATION_ERROR");
        assert_eq!(body["message"], "validation failed");
        let fields: Vec<&str> = body["details"]["fields"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["field"].as_str().unwrap())
            .collect();
        assert!(fields.contains(&"name"));
        assert!(fields.contains(&"age"));
    }

    #[tokio::test]
    async fn test_auth_short_circuit_through_pipeline() {
        use crate::middleware::auth::{AuthConfig, JwtAuth};
        use std::sync::atomic::{AtomicBool, Ordering};

        let hit = Arc::new(AtomicBool::new(false));
        let flag = hit.clone();

        let mut app = Application::new();
        app.route_with(
            "GET",
            "/secure",
            vec![Arc::new(JwtAuth::from_secret(b"secret", AuthConfig::new()))],
            handler_fn(move |ctx: Context| {
                let flag = flag.clone();
                async move {
                    flag.store(true, Ordering::SeqCst);
                    ctx.text("in")
                }
            }),
        );

        let out = app.handle(v2_event("GET", "/secure")).await;
        assert_eq!(out["statusCode"], 401);
        let body: Value = serde_json::from_str(out["body"].as_str().unwrap()).unwrap();
        assert_eq!(body["code"], "UNAUTHORIZED");
        assert!(!hit.load(Ordering::SeqCst), "handler must not run");
    }

    #[tokio::test]
    async fn test_circuit_opens_through_pipeline() {
        use crate::middleware::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
        use std::sync::atomic::{AtomicUsize, Ordering};

        let breaker: Arc<dyn Middleware> = Arc::new(CircuitBreaker::new(
            CircuitBreakerConfig::new().with_failure_threshold(3),
        ));
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        let mut app = Application::new();
        app.route_with(
            "GET",
            "/downstream",
            vec![breaker],
            handler_fn(move |_ctx| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(LiftError::internal("downstream failed"))
                }
            }),
        );

        for _ in 0..3 {
            let out = app.handle(v2_event("GET", "/downstream")).await;
            assert_eq!(out["statusCode"], 500);
        }

        let out = app.handle(v2_event("GET", "/downstream")).await;
        assert_eq!(out["statusCode"], 503);
        let body: Value = serde_json::from_str(out["body"].as_str().unwrap()).unwrap();
        assert_eq!(body["code"], "SERVICE_UNAVAILABLE");
        assert_eq!(hits.load(Ordering::SeqCst), 3, "open circuit must not invoke handler");
    }

    #[tokio::test]
    async fn test_websocket_connect_sees_query_parameters() {
        let mut app = Application::new();
        app.websocket(
            "$connect",
            handler_fn(|ctx: Context| async move {
                let token = ctx.query("Authorization").unwrap_or_default();
                assert!(!token.is_empty());
                let connection = ctx
                    .request()
                    .metadata_value("connectionId")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                ctx.json(&json!({ "connected": connection }))
            }),
        );

        let event = json!({
            "requestContext": {
                "routeKey": "$connect",
                "connectionId": "c-1",
                "domainName": "ws.example.com",
                "stage": "prod"
            },
            "queryStringParameters": { "Authorization": "eyJhbGciOiJIUzI1NiJ9" }
        });
        let out = app.handle(event).await;
        assert_eq!(out["statusCode"], 200);
        assert_eq!(out["body"], r#"{"connected":"c-1"}"#);
    }

    #[tokio::test]
    async fn test_cache_buffers_and_replays_through_pipeline() {
        use crate::middleware::cache::{CacheConfig, ResponseCache};
        use std::sync::atomic::{AtomicUsize, Ordering};

        let cache: Arc<dyn Middleware> = Arc::new(ResponseCache::new(CacheConfig::new()));
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        let mut app = Application::new();
        app.route_with(
            "GET",
            "/cached",
            vec![cache],
            handler_fn(move |ctx: Context| {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    ctx.json(&json!({ "n": n }))
                }
            }),
        );

        let first = app.handle(v2_event("GET", "/cached")).await;
        let second = app.handle(v2_event("GET", "/cached")).await;
        assert_eq!(first["body"], r#"{"n":1}"#);
        assert_eq!(second["body"], r#"{"n":1}"#);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_error_body_round_trip() {
        use crate::error::ErrorBody;

        let mut app = Application::new();
        app.get("/teapot", handler_fn(|_ctx| async {
            Err(LiftError::validation("bad input").with_detail("fields", json!([])))
        }));

        let out = app.handle(v2_event("GET", "/teapot")).await;
        let parsed: ErrorBody = serde_json::from_str(out["body"].as_str().unwrap()).unwrap();
        assert_eq!(parsed.code, "VALIDATION_ERROR");
        assert_eq!(parsed.message, "bad input");
        assert!(parsed.details.contains_key("fields"));
    }

    #[tokio::test]
    async fn test_empty_body_response() {
        let mut app = Application::new();
        app.get("/nothing", handler_fn(|ctx: Context| async move {
            ctx.no_content(http::StatusCode::NO_CONTENT)
        }));

        let out = app.handle(v2_event("GET", "/nothing")).await;
        assert_eq!(out["statusCode"], 204);
        assert_eq!(out["body"], "");
    }
}
