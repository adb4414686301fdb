//! Cross-origin resource sharing middleware
//!
//! Adds `Access-Control-*` headers for matching origins and short-circuits
//! preflight `OPTIONS` requests with 204.

use async_trait::async_trait;
use http::StatusCode;

use crate::context::Context;
use crate::error::Result;
use crate::middleware::{Middleware, Next};

/// Configuration for [`Cors`]
#[derive(Debug, Clone)]
pub struct CorsConfig {
    /// Origins allowed to call; `*` allows any
    pub allowed_origins: Vec<String>,
    /// Methods advertised in preflight responses
    pub allowed_methods: Vec<String>,
    /// Headers advertised in preflight responses
    pub allowed_headers: Vec<String>,
    /// Preflight cache lifetime in seconds
    pub max_age_secs: u64,
    /// Whether credentialed requests are allowed
    pub allow_credentials: bool,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
            allowed_methods: vec![
                "GET".into(),
                "POST".into(),
                "PUT".into(),
                "PATCH".into(),
                "DELETE".into(),
                "OPTIONS".into(),
            ],
            allowed_headers: vec!["content-type".into(), "authorization".into()],
            max_age_secs: 600,
            allow_credentials: false,
        }
    }
}

impl CorsConfig {
    /// Default configuration (any origin)
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to specific origins
    pub fn with_origins(mut self, origins: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.allowed_origins = origins.into_iter().map(Into::into).collect();
        self
    }

    /// Advertise custom headers
    pub fn with_headers(mut self, headers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.allowed_headers = headers.into_iter().map(Into::into).collect();
        self
    }

    /// Allow credentialed requests
    pub fn with_credentials(mut self, allow: bool) -> Self {
        self.allow_credentials = allow;
        self
    }

    fn origin_allowed(&self, origin: &str) -> bool {
        self.allowed_origins.iter().any(|o| o == "*" || o == origin)
    }
}

/// CORS middleware
#[derive(Debug, Default)]
pub struct Cors {
    config: CorsConfig,
}

impl Cors {
    /// Middleware allowing any origin
    pub fn new() -> Self {
        Self::default()
    }

    /// Middleware with a custom configuration
    pub fn with_config(config: CorsConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Middleware for Cors {
    async fn handle(&self, ctx: Context, next: Next<'_>) -> Result<()> {
        if let Some(origin) = ctx.header("origin") {
            if self.config.origin_allowed(origin) {
                let allow_origin = if self.config.allow_credentials {
                    origin.to_string()
                } else if self.config.allowed_origins.iter().any(|o| o == "*") {
                    "*".to_string()
                } else {
                    origin.to_string()
                };
                ctx.set_header("access-control-allow-origin", allow_origin);
                if self.config.allow_credentials {
                    ctx.set_header("access-control-allow-credentials", "true");
                }
            }
        }

        if ctx.method() == "OPTIONS" {
            ctx.set_header(
                "access-control-allow-methods",
                self.config.allowed_methods.join(", "),
            );
            ctx.set_header(
                "access-control-allow-headers",
                self.config.allowed_headers.join(", "),
            );
            ctx.set_header("access-control-max-age", self.config.max_age_secs.to_string());
            return ctx.no_content(StatusCode::NO_CONTENT);
        }

        next.run(ctx).await
    }

    fn name(&self) -> &'static str {
        "cors"
    }
}
