//! Per-invocation context
//!
//! Exactly one [`Context`] exists per invocation. It is a cheap-to-clone
//! handle (the interior is shared) so async handlers and middleware can hold
//! it across await points; the response lives behind a short-critical-section
//! lock. A context is never shared across invocations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use http::StatusCode;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::Span;

use crate::error::{LiftError, Result};
use crate::request::Request;
use crate::response::{Body, Response};

/// Authenticated principal attached by the auth middleware
#[derive(Debug, Clone, Default)]
pub struct Identity {
    /// Tenant identifier, when multi-tenant claims are present
    pub tenant_id: Option<String>,
    /// Authenticated user identifier
    pub user_id: Option<String>,
    /// Role names granted to the principal
    pub roles: Vec<String>,
    /// Full claim set from the verified token
    pub claims: Option<Map<String, Value>>,
}

struct ContextInner {
    request: Request,
    response: Mutex<Response>,
    deadline: Option<Instant>,
    request_id: OnceLock<String>,
    identity: Mutex<Identity>,
    values: Mutex<HashMap<String, Value>>,
    span: Span,
}

/// Request-scoped state carrier handed to middleware and handlers
///
/// Owns response construction: handlers write through [`Context::json`],
/// [`Context::text`], [`Context::binary`], or [`Context::status`].
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Create the context for one invocation
    pub fn new(request: Request, deadline: Option<Instant>) -> Self {
        let span = tracing::info_span!(
            "invocation",
            method = %request.method(),
            path = %request.path(),
            trigger = %request.trigger(),
        );
        Self {
            inner: Arc::new(ContextInner {
                request,
                response: Mutex::new(Response::new()),
                deadline,
                request_id: OnceLock::new(),
                identity: Mutex::new(Identity::default()),
                values: Mutex::new(HashMap::new()),
                span,
            }),
        }
    }

    /// The normalized request
    pub fn request(&self) -> &Request {
        &self.inner.request
    }

    /// Uppercase method token
    pub fn method(&self) -> &str {
        self.inner.request.method()
    }

    /// Normalized path
    pub fn path(&self) -> &str {
        self.inner.request.path()
    }

    /// Captured path parameter
    pub fn param(&self, name: &str) -> Option<&str> {
        self.inner.request.param(name)
    }

    /// Query parameter, first-value semantics
    pub fn query(&self, name: &str) -> Option<&str> {
        self.inner.request.query(name)
    }

    /// Request header by case-insensitive name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.inner.request.header(name)
    }

    /// Invocation span for structured logging
    pub fn span(&self) -> &Span {
        &self.inner.span
    }

    // ------------------------------------------------------------------
    // Deadline
    // ------------------------------------------------------------------

    /// Platform deadline for this invocation, when one was supplied
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Time remaining before the platform deadline
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Whether the deadline has already passed
    pub fn deadline_expired(&self) -> bool {
        matches!(self.remaining(), Some(d) if d.is_zero())
    }

    // ------------------------------------------------------------------
    // Request id
    // ------------------------------------------------------------------

    /// Correlation id attached by the request-id middleware
    pub fn request_id(&self) -> Option<&str> {
        self.inner.request_id.get().map(|s| s.as_str())
    }

    /// Attach the correlation id; first write wins
    pub fn set_request_id(&self, id: impl Into<String>) {
        let _ = self.inner.request_id.set(id.into());
    }

    // ------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------

    /// Tenant identifier, when authenticated claims carried one
    pub fn tenant_id(&self) -> Option<String> {
        self.inner.identity.lock().expect("identity lock").tenant_id.clone()
    }

    /// Authenticated user identifier
    pub fn user_id(&self) -> Option<String> {
        self.inner.identity.lock().expect("identity lock").user_id.clone()
    }

    /// Roles granted to the authenticated principal
    pub fn roles(&self) -> Vec<String> {
        self.inner.identity.lock().expect("identity lock").roles.clone()
    }

    /// Full verified claim set
    pub fn claims(&self) -> Option<Map<String, Value>> {
        self.inner.identity.lock().expect("identity lock").claims.clone()
    }

    /// Replace the authenticated identity (auth middleware)
    pub fn set_identity(&self, identity: Identity) {
        *self.inner.identity.lock().expect("identity lock") = identity;
    }

    /// Set only the tenant identifier
    pub fn set_tenant_id(&self, tenant: impl Into<String>) {
        self.inner.identity.lock().expect("identity lock").tenant_id = Some(tenant.into());
    }

    // ------------------------------------------------------------------
    // User key/value store
    // ------------------------------------------------------------------

    /// Store a request-scoped value
    pub fn set_value(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.inner
            .values
            .lock()
            .expect("values lock")
            .insert(key.into(), value.into());
    }

    /// Fetch a request-scoped value
    pub fn value(&self, key: &str) -> Option<Value> {
        self.inner.values.lock().expect("values lock").get(key).cloned()
    }

    // ------------------------------------------------------------------
    // Response construction
    // ------------------------------------------------------------------

    /// Run a closure against the response under its lock
    pub fn with_response<R>(&self, f: impl FnOnce(&mut Response) -> R) -> R {
        let mut resp = self.inner.response.lock().expect("response lock");
        f(&mut resp)
    }

    /// Snapshot of the response (for inspection in middleware and tests)
    pub fn response_snapshot(&self) -> Response {
        self.inner.response.lock().expect("response lock").clone()
    }

    /// Set the response status; chainable before a terminal write
    pub fn status(&self, status: StatusCode) -> &Self {
        self.with_response(|r| r.set_status(status));
        self
    }

    /// Set a response header
    pub fn set_header(&self, name: &str, value: impl Into<String>) -> &Self {
        self.with_response(|r| r.set_header(name, value));
        self
    }

    /// Terminal write of structured data as JSON
    pub fn json<T: Serialize>(&self, value: &T) -> Result<()> {
        self.with_response(|r| r.write_json(value))
    }

    /// Terminal write of plain text
    pub fn text(&self, text: impl Into<String>) -> Result<()> {
        self.with_response(|r| r.write_text(text))
    }

    /// Terminal write of raw bytes (base64-encoded at the HTTP boundary)
    pub fn binary(&self, bytes: Vec<u8>) -> Result<()> {
        self.with_response(|r| r.write_binary(bytes))
    }

    /// Terminal write with no body and the given status
    pub fn no_content(&self, status: StatusCode) -> Result<()> {
        self.with_response(|r| {
            r.set_status(status);
            r.write_empty()
        })
    }

    /// Replace the response with a mapped error body (runtime use)
    pub(crate) fn write_error(&self, err: &LiftError) {
        self.with_response(|r| {
            if r.header("content-type").is_none() {
                r.set_header("content-type", "application/json");
            }
            r.force_write(err.status, Body::Json(err.body()));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::TriggerType;
    use serde_json::json;

    fn ctx() -> Context {
        Context::new(Request::new("GET", "/x", TriggerType::HttpV2), None)
    }

    #[test]
    fn test_response_write_through_context() {
        let c = ctx();
        c.status(StatusCode::CREATED);
        c.json(&json!({"id": 1})).unwrap();

        let resp = c.response_snapshot();
        assert_eq!(resp.status().as_u16(), 201);
        assert!(resp.is_written());
    }

    #[test]
    fn test_request_id_first_write_wins() {
        let c = ctx();
        c.set_request_id("req-1");
        c.set_request_id("req-2");
        assert_eq!(c.request_id(), Some("req-1"));
    }

    #[test]
    fn test_identity_roundtrip() {
        let c = ctx();
        c.set_identity(Identity {
            tenant_id: Some("t-1".into()),
            user_id: Some("u-1".into()),
            roles: vec!["admin".into()],
            claims: None,
        });
        assert_eq!(c.tenant_id().as_deref(), Some("t-1"));
        assert_eq!(c.user_id().as_deref(), Some("u-1"));
        assert_eq!(c.roles(), vec!["admin".to_string()]);
    }

    #[test]
    fn test_values_store() {
        let c = ctx();
        c.set_value("k", json!([1, 2]));
        assert_eq!(c.value("k"), Some(json!([1, 2])));
        assert_eq!(c.value("missing"), None);
    }

    #[test]
    fn test_clone_shares_state() {
        let c = ctx();
        let c2 = c.clone();
        c2.set_value("shared", json!(true));
        assert_eq!(c.value("shared"), Some(json!(true)));
    }

    #[test]
    fn test_deadline_expired() {
        let req = Request::new("GET", "/x", TriggerType::HttpV2);
        let past = Instant::now() - Duration::from_secs(1);
        let c = Context::new(req, Some(past));
        assert!(c.deadline_expired());
        assert_eq!(c.remaining(), Some(Duration::ZERO));
    }
}
