//! Deadline middleware
//!
//! Wraps the inner chain in a deadline derived from configuration (or a
//! dynamic calculator) and capped by the platform deadline carried in the
//! context. On expiry the inner future is dropped, cancelling downstream
//! work, and the request fails with `TIMEOUT`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::context::Context;
use crate::error::{LiftError, Result};
use crate::middleware::{Middleware, Next};

/// Computes a per-request deadline
pub type TimeoutCalculator = Arc<dyn Fn(&Context) -> Duration + Send + Sync>;

/// Deadline middleware
pub struct Timeout {
    default: Duration,
    calculator: Option<TimeoutCalculator>,
}

impl Timeout {
    /// Fixed deadline for every request
    pub fn new(timeout: Duration) -> Self {
        Self {
            default: timeout,
            calculator: None,
        }
    }

    /// Derive the deadline per request
    pub fn with_calculator(mut self, calculator: TimeoutCalculator) -> Self {
        self.calculator = Some(calculator);
        self
    }

    fn effective(&self, ctx: &Context) -> Duration {
        let configured = match &self.calculator {
            Some(calc) => calc(ctx),
            None => self.default,
        };
        match ctx.remaining() {
            Some(remaining) => configured.min(remaining),
            None => configured,
        }
    }
}

#[async_trait]
impl Middleware for Timeout {
    async fn handle(&self, ctx: Context, next: Next<'_>) -> Result<()> {
        let deadline = self.effective(&ctx);
        if deadline.is_zero() {
            return Err(LiftError::timeout("deadline already expired"));
        }

        match tokio::time::timeout(deadline, next.run(ctx)).await {
            Ok(result) => result,
            Err(_) => Err(LiftError::timeout(format!(
                "request exceeded {}ms deadline",
                deadline.as_millis()
            ))),
        }
    }

    fn name(&self) -> &'static str {
        "timeout"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{handler_fn, Handler};
    use crate::request::{Request, TriggerType};
    use std::time::Instant;

    fn ctx(deadline: Option<Instant>) -> Context {
        Context::new(Request::new("GET", "/x", TriggerType::HttpV2), deadline)
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_handler_times_out() {
        let chain: Vec<Arc<dyn Middleware>> =
            vec![Arc::new(Timeout::new(Duration::from_millis(50)))];
        let handler: Arc<dyn Handler> = Arc::new(handler_fn(|_ctx| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        }));

        let err = Next::new(&chain, &handler).run(ctx(None)).await.unwrap_err();
        assert_eq!(err.code.as_str(), "TIMEOUT");
        assert_eq!(err.status.as_u16(), 504);
    }

    #[tokio::test]
    async fn test_fast_handler_passes() {
        let chain: Vec<Arc<dyn Middleware>> =
            vec![Arc::new(Timeout::new(Duration::from_secs(5)))];
        let handler: Arc<dyn Handler> =
            Arc::new(handler_fn(|ctx: Context| async move { ctx.text("quick") }));

        let c = ctx(None);
        Next::new(&chain, &handler).run(c.clone()).await.unwrap();
        assert_eq!(c.response_snapshot().body().to_wire_string(), "quick");
    }

    #[tokio::test]
    async fn test_expired_platform_deadline_rejected_on_entry() {
        let chain: Vec<Arc<dyn Middleware>> =
            vec![Arc::new(Timeout::new(Duration::from_secs(5)))];
        let handler: Arc<dyn Handler> = Arc::new(handler_fn(|_ctx| async { Ok(()) }));

        let expired = Instant::now() - Duration::from_secs(1);
        let err = Next::new(&chain, &handler)
            .run(ctx(Some(expired)))
            .await
            .unwrap_err();
        assert_eq!(err.code.as_str(), "TIMEOUT");
    }

    #[tokio::test(start_paused = true)]
    async fn test_platform_deadline_caps_configured_timeout() {
        let chain: Vec<Arc<dyn Middleware>> =
            vec![Arc::new(Timeout::new(Duration::from_secs(60)))];
        let handler: Arc<dyn Handler> = Arc::new(handler_fn(|_ctx| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }));

        let platform = Instant::now() + Duration::from_millis(100);
        let err = Next::new(&chain, &handler)
            .run(ctx(Some(platform)))
            .await
            .unwrap_err();
        assert_eq!(err.code.as_str(), "TIMEOUT");
    }
}
