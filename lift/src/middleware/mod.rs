//! Middleware composition
//!
//! A middleware wraps the downstream chain: pre-logic runs in registration
//! order, post-logic in reverse, and a middleware may short-circuit without
//! invoking the rest of the chain while still running its own post-logic.
//! Middleware that needs to observe the response body (caching, auditing)
//! declares [`Middleware::buffers_response`]; the runtime scans the chain at
//! composition time and switches the response into buffered mode.

pub mod auth;
pub mod bulkhead;
pub mod cache;
pub mod circuit_breaker;
pub mod cors;
pub mod load_shed;
pub mod logger;
pub mod rate_limit;
pub mod recover;
pub mod request_id;
pub mod retry;
pub mod timeout;

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::Context;
use crate::error::Result;
use crate::handler::Handler;

/// Cross-cutting behavior wrapped around a [`Handler`]
///
/// Implementations must invoke `next.run(ctx)` exactly once, or short-circuit
/// without invoking it (writing a response or returning an error).
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    /// Run pre-logic, delegate to the rest of the chain, run post-logic
    async fn handle(&self, ctx: Context, next: Next<'_>) -> Result<()>;

    /// Whether this middleware needs terminal writes captured in a buffer
    /// it can observe after the inner chain completes
    fn buffers_response(&self) -> bool {
        false
    }

    /// Name used in structured logs
    fn name(&self) -> &'static str {
        "middleware"
    }
}

/// The remainder of the chain from one middleware's point of view
///
/// `run` borrows rather than consumes, so retrying middleware may execute
/// the inner chain more than once.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    middleware: &'a [Arc<dyn Middleware>],
    handler: &'a Arc<dyn Handler>,
}

impl<'a> Next<'a> {
    pub(crate) fn new(middleware: &'a [Arc<dyn Middleware>], handler: &'a Arc<dyn Handler>) -> Self {
        Self { middleware, handler }
    }

    /// Execute the rest of the chain
    pub async fn run(&self, ctx: Context) -> Result<()> {
        match self.middleware.split_first() {
            Some((first, rest)) => {
                let next = Next {
                    middleware: rest,
                    handler: self.handler,
                };
                first.handle(ctx, next).await
            }
            None => self.handler.call(ctx).await,
        }
    }
}

/// Extracts a request priority (0 = lowest) for bulkhead queuing and
/// priority-based load shedding
pub type PriorityExtractor = Arc<dyn Fn(&Context) -> u8 + Send + Sync>;

/// Whether any middleware in the chain requests response interception
pub(crate) fn chain_buffers(middleware: &[Arc<dyn Middleware>]) -> bool {
    middleware.iter().any(|m| m.buffers_response())
}
