//! Response model with write-through and buffered modes
//!
//! A response allows at most one terminal write per invocation. Middleware
//! that needs to observe or rewrite the body (caching, idempotency) asks the
//! runtime to switch the response into buffered mode, where terminal writes
//! may be replaced until [`Response::flush`] seals it.

use std::collections::HashMap;

use base64::Engine;
use http::StatusCode;
use serde::Serialize;
use serde_json::Value;

use crate::error::{LiftError, Result};

/// Body payload awaiting transport encoding
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// No terminal write occurred
    Empty,
    /// Structured data, serialized as JSON at encode time
    Json(Value),
    /// Plain text
    Text(String),
    /// Raw bytes, base64-encoded at the HTTP boundary
    Binary(Vec<u8>),
}

impl Body {
    /// Serialized string form as it will appear on the wire
    pub fn to_wire_string(&self) -> String {
        match self {
            Self::Empty => String::new(),
            Self::Json(v) => v.to_string(),
            Self::Text(s) => s.clone(),
            Self::Binary(b) => base64::engine::general_purpose::STANDARD.encode(b),
        }
    }

    /// Whether the wire form must be flagged base64-encoded
    pub fn is_base64(&self) -> bool {
        matches!(self, Self::Binary(_))
    }

    /// Wire length in bytes
    pub fn len(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Json(v) => v.to_string().len(),
            Self::Text(s) => s.len(),
            Self::Binary(b) => b.len(),
        }
    }

    /// Whether no body content is present
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

/// Per-invocation response under construction
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: HashMap<String, String>,
    body: Body,
    written: bool,
    buffered: bool,
    flushed: bool,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HashMap::new(),
            body: Body::Empty,
            written: false,
            buffered: false,
            flushed: false,
        }
    }
}

impl Response {
    /// Fresh response with status 200 and no body
    pub fn new() -> Self {
        Self::default()
    }

    /// Current status code
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Set the status code
    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    /// Header by case-insensitive name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|v| v.as_str())
    }

    /// All headers (lowercased names)
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Set a header, replacing any existing value
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
    }

    /// Whether a terminal write has occurred
    pub fn is_written(&self) -> bool {
        self.written
    }

    /// Whether terminal writes are captured for later inspection
    pub fn is_buffered(&self) -> bool {
        self.buffered
    }

    /// Switch the response into buffered mode (runtime-driven, before the
    /// middleware chain executes)
    pub(crate) fn set_buffered(&mut self, buffered: bool) {
        self.buffered = buffered;
    }

    /// Current body
    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Terminal write of structured data; serialized as JSON at encode time
    pub fn write_json<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let v = serde_json::to_value(value)
            .map_err(|e| LiftError::internal(format!("response serialization failed: {e}")))?;
        self.write_body(Body::Json(v))
    }

    /// Terminal write of plain text
    pub fn write_text(&mut self, text: impl Into<String>) -> Result<()> {
        self.write_body(Body::Text(text.into()))
    }

    /// Terminal write of raw bytes
    pub fn write_binary(&mut self, bytes: Vec<u8>) -> Result<()> {
        self.write_body(Body::Binary(bytes))
    }

    fn write_body(&mut self, body: Body) -> Result<()> {
        if self.flushed {
            return Err(LiftError::internal("response already flushed"));
        }
        if self.written && !self.buffered {
            return Err(LiftError::internal("response already written"));
        }
        self.body = body;
        self.written = true;
        Ok(())
    }

    /// Terminal write with no body content
    pub fn write_empty(&mut self) -> Result<()> {
        self.write_body(Body::Empty)
    }

    /// Replace status and body unconditionally (error mapping)
    ///
    /// The mapped error always displaces whatever partial state the chain
    /// left behind, except after flush.
    pub(crate) fn force_write(&mut self, status: StatusCode, body: Body) {
        if self.flushed {
            return;
        }
        self.status = status;
        self.body = body;
        self.written = true;
    }

    /// Replace the captured body without tripping the single-write guard
    ///
    /// Only meaningful in buffered mode; used by intercepting middleware.
    pub fn replace_body(&mut self, body: Body) -> Result<()> {
        if !self.buffered {
            return Err(LiftError::internal(
                "replace_body requires a buffered response",
            ));
        }
        if self.flushed {
            return Err(LiftError::internal("response already flushed"));
        }
        self.body = body;
        self.written = true;
        Ok(())
    }

    /// Seal the response; further writes fail
    pub fn flush(&mut self) {
        self.flushed = true;
    }

    /// Whether the response has been sealed
    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    /// Reset terminal-write state between retry attempts
    pub(crate) fn reset_for_retry(&mut self) {
        if !self.flushed {
            self.status = StatusCode::OK;
            self.body = Body::Empty;
            self.written = false;
        }
    }
}
