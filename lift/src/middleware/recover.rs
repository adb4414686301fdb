//! Panic recovery middleware
//!
//! Captures panics in the inner chain and converts them to
//! `INTERNAL_ERROR`. Production responses carry the sanitized 500 body; a
//! development configuration attaches the panic message and a captured
//! backtrace to the error details. The backtrace is always logged.

use std::backtrace::Backtrace;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;

use crate::context::Context;
use crate::error::{LiftError, Result};
use crate::middleware::{Middleware, Next};

/// Panic recovery middleware
#[derive(Debug, Default)]
pub struct Recover {
    development: bool,
}

impl Recover {
    /// Production-mode recovery: panics yield the sanitized 500 body
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach panic text and backtrace to the response details (development
    /// environments only)
    pub fn with_development(mut self, development: bool) -> Self {
        self.development = development;
        self
    }
}

#[async_trait]
impl Middleware for Recover {
    async fn handle(&self, ctx: Context, next: Next<'_>) -> Result<()> {
        match AssertUnwindSafe(next.run(ctx)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                let err = LiftError::from_panic(payload.as_ref());
                let backtrace = Backtrace::force_capture().to_string();
                tracing::error!(panic = %err.message, %backtrace, "recovered from panic");

                if self.development {
                    Err(LiftError::internal(err.message.clone())
                        .with_detail("panic", err.message)
                        .with_detail("stack", backtrace))
                } else {
                    Err(err)
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "recover"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{handler_fn, Handler};
    use crate::request::{Request, TriggerType};
    use std::sync::Arc;

    fn ctx() -> Context {
        Context::new(Request::new("GET", "/x", TriggerType::HttpV2), None)
    }

    fn panicking_handler() -> Arc<dyn Handler> {
        Arc::new(handler_fn(|_ctx| async { panic!("kaboom") }))
    }

    #[tokio::test]
    async fn test_production_panic_is_opaque() {
        let chain: Vec<Arc<dyn Middleware>> = vec![Arc::new(Recover::new())];
        let handler = panicking_handler();
        let err = Next::new(&chain, &handler).run(ctx()).await.unwrap_err();

        assert_eq!(err.status.as_u16(), 500);
        assert!(err.is_opaque());
        assert_eq!(err.body(), serde_json::json!({ "error": "Internal server error" }));
    }

    #[tokio::test]
    async fn test_development_panic_carries_stack() {
        let chain: Vec<Arc<dyn Middleware>> =
            vec![Arc::new(Recover::new().with_development(true))];
        let handler = panicking_handler();
        let err = Next::new(&chain, &handler).run(ctx()).await.unwrap_err();

        assert_eq!(err.status.as_u16(), 500);
        assert!(!err.is_opaque());
        assert_eq!(err.details["panic"], "kaboom");
        assert!(err.details.contains_key("stack"));
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let chain: Vec<Arc<dyn Middleware>> = vec![Arc::new(Recover::new())];
        let handler: Arc<dyn Handler> =
            Arc::new(handler_fn(|ctx: Context| async move { ctx.text("fine") }));
        let c = ctx();
        Next::new(&chain, &handler).run(c.clone()).await.unwrap();
        assert_eq!(c.response_snapshot().body().to_wire_string(), "fine");
    }
}
