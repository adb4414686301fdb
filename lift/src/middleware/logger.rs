//! Structured request logging
//!
//! Emits one record when the request enters the chain and one when it
//! leaves, with method, path, correlation id, tenant, duration, status, and
//! an error summary. Header values and body bytes are never logged;
//! sensitive header names are treated as radioactive throughout.

use std::time::Instant;

use async_trait::async_trait;

use crate::context::Context;
use crate::error::Result;
use crate::middleware::{Middleware, Next};

/// Header names whose values must never reach a log sink
pub const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "set-cookie",
    "x-api-key",
    "x-auth-token",
];

/// Whether a header's value must be redacted before logging
pub fn is_sensitive_header(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    SENSITIVE_HEADERS.iter().any(|h| *h == name)
}

/// Request logging middleware
#[derive(Debug, Default)]
pub struct Logger;

impl Logger {
    /// Create the logging middleware
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Middleware for Logger {
    async fn handle(&self, ctx: Context, next: Next<'_>) -> Result<()> {
        let started = Instant::now();

        tracing::info!(
            method = %ctx.method(),
            path = %ctx.path(),
            trigger = %ctx.request().trigger(),
            request_id = ctx.request_id().unwrap_or("-"),
            tenant_id = ctx.tenant_id().as_deref().unwrap_or("-"),
            "request started"
        );

        let result = next.run(ctx.clone()).await;

        let duration_ms = started.elapsed().as_millis() as u64;
        let status = match &result {
            Ok(()) => ctx.response_snapshot().status().as_u16(),
            Err(e) => e.status.as_u16(),
        };

        match &result {
            Ok(()) => {
                tracing::info!(
                    method = %ctx.method(),
                    path = %ctx.path(),
                    request_id = ctx.request_id().unwrap_or("-"),
                    tenant_id = ctx.tenant_id().as_deref().unwrap_or("-"),
                    status,
                    duration_ms,
                    "request completed"
                );
            }
            Err(e) => {
                tracing::warn!(
                    method = %ctx.method(),
                    path = %ctx.path(),
                    request_id = ctx.request_id().unwrap_or("-"),
                    tenant_id = ctx.tenant_id().as_deref().unwrap_or("-"),
                    status,
                    duration_ms,
                    code = %e.code,
                    error = %e.message,
                    "request failed"
                );
            }
        }

        result
    }

    fn name(&self) -> &'static str {
        "logger"
    }
}
