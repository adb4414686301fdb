//! Error taxonomy and transport mapping
//!
//! Every user-facing failure in the framework is a [`LiftError`]: a short
//! uppercase code, a human-readable message, an HTTP status in the 4xx/5xx
//! range, and optional structured details. Unclassified failures are wrapped
//! via [`LiftError::unclassified`] and never leak internal text to clients.

use std::fmt;

use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Result type alias using the framework error
pub type Result<T> = std::result::Result<T, LiftError>;

/// Canonical error classes with their wire codes and default statuses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Request body failed field-level validation (422)
    ValidationError,
    /// Malformed input (400)
    BadRequest,
    /// Missing or invalid authentication (401)
    Unauthorized,
    /// Authenticated but not permitted (403)
    Forbidden,
    /// No matching resource (404)
    NotFound,
    /// Method not permitted for path (405)
    MethodNotAllowed,
    /// Conflict with current state (409)
    Conflict,
    /// Rate exceeded (429)
    RateLimitExceeded,
    /// Downstream unavailable or breaker open (503)
    ServiceUnavailable,
    /// Load shedding rejected the request (503)
    LoadShed,
    /// Bulkhead concurrency limit reached (503)
    BulkheadFull,
    /// Deadline exceeded (504)
    Timeout,
    /// Pool acquisition exceeded the invocation deadline (504)
    ResourceTimeout,
    /// Raw event shape did not match any known trigger (400)
    UnsupportedEvent,
    /// Internal or unclassified failure (500)
    InternalError,
}

impl ErrorCode {
    /// Wire token for this error class
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationError => "VALIDATION_ERROR",
            Self::BadRequest => "BAD_REQUEST",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden => "FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            Self::Conflict => "CONFLICT",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::LoadShed => "LOAD_SHED",
            Self::BulkheadFull => "BULKHEAD_FULL",
            Self::Timeout => "TIMEOUT",
            Self::ResourceTimeout => "RESOURCE_TIMEOUT",
            Self::UnsupportedEvent => "UNSUPPORTED_EVENT",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Default HTTP status for this error class
    pub fn default_status(&self) -> StatusCode {
        match self {
            Self::ValidationError => StatusCode::UNPROCESSABLE_ENTITY,
            Self::BadRequest | Self::UnsupportedEvent => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::Conflict => StatusCode::CONFLICT,
            Self::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            Self::ServiceUnavailable | Self::LoadShed | Self::BulkheadFull => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Timeout | Self::ResourceTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Typed error carrier for the request pipeline
///
/// Handlers and middleware return `LiftError` for user-facing failures. The
/// runtime maps the error to a transport response whose status equals
/// [`LiftError::status`] and whose body carries `code`, `message`, and
/// non-empty `details`. The `cause` chain is preserved for logging but is
/// never serialized.
#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct LiftError {
    /// Error class token
    pub code: ErrorCode,
    /// Human-readable message
    pub message: String,
    /// HTTP status used for transport mapping (400..=599)
    pub status: StatusCode,
    /// Structured data for the response body
    pub details: Map<String, Value>,
    /// Wrapped underlying error, logged but never serialized
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Unclassified failures get a sanitized body instead of code/message
    opaque: bool,
}

impl LiftError {
    /// Create an error with the code's default status
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status: code.default_status(),
            details: Map::new(),
            cause: None,
            opaque: false,
        }
    }

    /// Override the transport status; values outside 400..=599 fall back to
    /// the code's default
    pub fn with_status(mut self, status: StatusCode) -> Self {
        if (400..=599).contains(&status.as_u16()) {
            self.status = status;
        } else {
            self.status = self.code.default_status();
        }
        self
    }

    /// Attach a structured detail entry
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Attach an underlying cause, preserved for logs only
    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Wrap an unclassified error: mapped to 500 with a sanitized body
    pub fn unclassified(cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self {
            code: ErrorCode::InternalError,
            message: cause.to_string(),
            status: StatusCode::INTERNAL_SERVER_ERROR,
            details: Map::new(),
            cause: Some(Box::new(cause)),
            opaque: true,
        }
    }

    /// Panic payloads are unclassified by definition
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "handler panicked".to_string()
        };
        Self {
            code: ErrorCode::InternalError,
            message,
            status: StatusCode::INTERNAL_SERVER_ERROR,
            details: Map::new(),
            cause: None,
            opaque: true,
        }
    }

    /// Whether this error must be serialized as a sanitized 500 body
    pub fn is_opaque(&self) -> bool {
        self.opaque
    }

    /// Response body for this error
    ///
    /// Typed errors serialize as `{code, message, details?}`; opaque errors
    /// as the fixed `{"error": "Internal server error"}` body.
    pub fn body(&self) -> Value {
        if self.opaque {
            return json!({ "error": "Internal server error" });
        }
        let mut body = Map::new();
        body.insert("code".into(), Value::String(self.code.as_str().into()));
        body.insert("message".into(), Value::String(self.message.clone()));
        if !self.details.is_empty() {
            body.insert("details".into(), Value::Object(self.details.clone()));
        }
        Value::Object(body)
    }

    // Convenience constructors for the taxonomy

    /// 422 validation failure
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    /// 400 malformed input
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    /// 401 missing or invalid authentication
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    /// 403 authenticated but not permitted
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    /// 404 no matching resource
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    /// 405 method mismatch on an otherwise matching pattern
    pub fn method_not_allowed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::MethodNotAllowed, message)
    }

    /// 409 conflict with current state
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Conflict, message)
    }

    /// 429 rate exceeded
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RateLimitExceeded, message)
    }

    /// 503 downstream unavailable or breaker open
    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServiceUnavailable, message)
    }

    /// 504 deadline exceeded
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    /// 500 internal failure with a typed body
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

/// Serializable error body, used when parsing responses in clients and tests
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error class token
    pub code: String,
    /// Human-readable message
    pub message: String,
    /// Structured details
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub details: Map<String, Value>,
}
