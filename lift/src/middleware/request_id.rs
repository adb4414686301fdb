//! Correlation id middleware
//!
//! Propagates an incoming correlation header or generates a fresh id, then
//! attaches it to the context, the response, and the invocation span.

use async_trait::async_trait;
use tracing::Instrument;
use uuid::Uuid;

use crate::context::Context;
use crate::error::Result;
use crate::middleware::{Middleware, Next};

/// Default correlation header
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Configuration for [`RequestId`]
#[derive(Debug, Clone)]
pub struct RequestIdConfig {
    /// Header checked for an incoming id and set on the response
    pub header: String,
}

impl Default for RequestIdConfig {
    fn default() -> Self {
        Self {
            header: REQUEST_ID_HEADER.to_string(),
        }
    }
}

impl RequestIdConfig {
    /// Create the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a custom correlation header name
    pub fn with_header(mut self, header: impl Into<String>) -> Self {
        self.header = header.into();
        self
    }
}

/// Correlation id middleware
#[derive(Debug, Default)]
pub struct RequestId {
    config: RequestIdConfig,
}

impl RequestId {
    /// Middleware with the default header
    pub fn new() -> Self {
        Self::default()
    }

    /// Middleware with a custom configuration
    pub fn with_config(config: RequestIdConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Middleware for RequestId {
    async fn handle(&self, ctx: Context, next: Next<'_>) -> Result<()> {
        let id = match ctx.header(&self.config.header) {
            Some(incoming) if !incoming.is_empty() => incoming.to_string(),
            _ => Uuid::new_v4().to_string(),
        };

        ctx.set_request_id(id.clone());
        ctx.set_header(&self.config.header, id.clone());

        let span = tracing::info_span!("request", request_id = %id);
        next.run(ctx).instrument(span).await
    }

    fn name(&self) -> &'static str {
        "request-id"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{handler_fn, Handler};
    use crate::request::{Request, TriggerType};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn ctx_with_header(value: Option<&str>) -> Context {
        let mut req = Request::new("GET", "/x", TriggerType::HttpV2);
        if let Some(v) = value {
            let mut headers = HashMap::new();
            headers.insert(REQUEST_ID_HEADER.to_string(), v.to_string());
            req.set_headers(headers);
        }
        Context::new(req, None)
    }

    async fn run(mw: RequestId, ctx: Context) {
        let chain: Vec<Arc<dyn Middleware>> = vec![Arc::new(mw)];
        let handler: Arc<dyn Handler> = Arc::new(handler_fn(|_ctx| async { Ok(()) }));
        Next::new(&chain, &handler).run(ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_propagates_incoming_id() {
        let ctx = ctx_with_header(Some("req-incoming"));
        run(RequestId::new(), ctx.clone()).await;

        assert_eq!(ctx.request_id(), Some("req-incoming"));
        assert_eq!(
            ctx.response_snapshot().header(REQUEST_ID_HEADER),
            Some("req-incoming")
        );
    }

    #[tokio::test]
    async fn test_generates_fresh_id() {
        let ctx = ctx_with_header(None);
        run(RequestId::new(), ctx.clone()).await;

        let id = ctx.request_id().expect("id generated").to_string();
        assert!(!id.is_empty());
        assert_eq!(ctx.response_snapshot().header(REQUEST_ID_HEADER), Some(id.as_str()));
    }

    #[tokio::test]
    async fn test_custom_header() {
        let mut req = Request::new("GET", "/x", TriggerType::HttpV2);
        let mut headers = HashMap::new();
        headers.insert("x-correlation-id".to_string(), "corr-1".to_string());
        req.set_headers(headers);
        let ctx = Context::new(req, None);

        let mw = RequestId::with_config(RequestIdConfig::new().with_header("x-correlation-id"));
        run(mw, ctx.clone()).await;
        assert_eq!(ctx.request_id(), Some("corr-1"));
    }
}
