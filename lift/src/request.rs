//! Normalized request model
//!
//! Adapters convert raw platform events into a [`Request`]; the router binds
//! path parameters; after that the request is immutable for the rest of the
//! invocation.

use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{LiftError, Result};

/// Classification of the event source that produced an invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerType {
    /// HTTP gateway, payload format v1
    HttpV1,
    /// HTTP gateway, payload format v2
    HttpV2,
    /// Queue message batch
    Queue,
    /// Object-store notification
    ObjectStore,
    /// Event-bus event
    EventBus,
    /// Scheduled trigger
    Scheduled,
    /// Change-capture stream record batch
    Stream,
    /// Persistent WebSocket connection event
    WebSocket,
}

impl TriggerType {
    /// Wire token for this trigger
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HttpV1 => "http-v1",
            Self::HttpV2 => "http-v2",
            Self::Queue => "queue-message",
            Self::ObjectStore => "object-event",
            Self::EventBus => "event-bus",
            Self::Scheduled => "scheduled",
            Self::Stream => "stream",
            Self::WebSocket => "websocket",
        }
    }

    /// Whether responses for this trigger are encoded in the gateway shape
    /// (`{statusCode, headers, body, isBase64Encoded}`)
    pub fn is_http(&self) -> bool {
        matches!(self, Self::HttpV1 | Self::HttpV2 | Self::WebSocket)
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Canonical request carrier for one invocation
///
/// Header names are case-insensitive (stored lowercased). Query parameters
/// use first-value semantics, with the multi-value map retained separately.
#[derive(Debug, Clone)]
pub struct Request {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    query: HashMap<String, String>,
    multi_query: HashMap<String, Vec<String>>,
    path_params: HashMap<String, String>,
    body: Vec<u8>,
    was_base64: bool,
    trigger: TriggerType,
    metadata: Map<String, Value>,
}

impl Request {
    /// Build a request from adapter output
    pub(crate) fn new(
        method: impl Into<String>,
        path: impl Into<String>,
        trigger: TriggerType,
    ) -> Self {
        Self {
            method: method.into().to_uppercase(),
            path: normalize_path(path.into()),
            headers: HashMap::new(),
            query: HashMap::new(),
            multi_query: HashMap::new(),
            path_params: HashMap::new(),
            body: Vec::new(),
            was_base64: false,
            trigger,
            metadata: Map::new(),
        }
    }

    pub(crate) fn set_headers(&mut self, headers: HashMap<String, String>) {
        self.headers = headers
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
    }

    pub(crate) fn insert_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
    }

    pub(crate) fn set_query(&mut self, query: HashMap<String, String>) {
        self.query = query;
    }

    pub(crate) fn set_multi_query(&mut self, multi: HashMap<String, Vec<String>>) {
        self.multi_query = multi;
    }

    pub(crate) fn set_body(&mut self, body: Vec<u8>, was_base64: bool) {
        self.body = body;
        self.was_base64 = was_base64;
    }

    pub(crate) fn set_metadata(&mut self, metadata: Map<String, Value>) {
        self.metadata = metadata;
    }

    pub(crate) fn bind_params(&mut self, params: HashMap<String, String>) {
        self.path_params = params;
    }

    /// Uppercase method token
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Normalized path (leading slash, no trailing slash except root)
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Trigger classification for this invocation
    pub fn trigger(&self) -> TriggerType {
        self.trigger
    }

    /// Header value by case-insensitive name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|v| v.as_str())
    }

    /// All headers (lowercased names)
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Query parameter, first-value semantics
    pub fn query(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(|v| v.as_str())
    }

    /// All query parameters (first-value)
    pub fn query_params(&self) -> &HashMap<String, String> {
        &self.query
    }

    /// Multi-value query parameters when the source preserved them
    pub fn multi_query(&self, name: &str) -> Option<&[String]> {
        self.multi_query.get(name).map(|v| v.as_slice())
    }

    /// Captured path parameter bound by the router
    pub fn param(&self, name: &str) -> Option<&str> {
        self.path_params.get(name).map(|v| v.as_str())
    }

    /// All bound path parameters
    pub fn params(&self) -> &HashMap<String, String> {
        &self.path_params
    }

    /// Raw body bytes (already base64-decoded when the source flagged it)
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Whether the source delivered the body base64-encoded
    pub fn was_base64_encoded(&self) -> bool {
        self.was_base64
    }

    /// Body as UTF-8, failing with `BAD_REQUEST` on invalid bytes
    pub fn body_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.body)
            .map_err(|_| LiftError::bad_request("request body is not valid UTF-8"))
    }

    /// Deserialize the JSON body, failing with `BAD_REQUEST` on parse errors
    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| LiftError::bad_request(format!("invalid JSON body: {e}")))
    }

    /// Source request-context metadata, preserved verbatim
    ///
    /// Carries connection-id for WebSockets, message-id for queues, event-id
    /// for buses, and stage for gateways.
    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    /// Single metadata value by key
    pub fn metadata_value(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }
}

/// Apply the canonical path form: leading slash, no trailing slash except root
pub(crate) fn normalize_path(path: String) -> String {
    let mut p = if path.starts_with('/') {
        path
    } else {
        format!("/{path}")
    };
    while p.len() > 1 && p.ends_with('/') {
        p.pop();
    }
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_tokens() {
        assert_eq!(TriggerType::HttpV2.as_str(), "http-v2");
        assert_eq!(TriggerType::Queue.as_str(), "queue-message");
        assert!(TriggerType::HttpV1.is_http());
        assert!(TriggerType::WebSocket.is_http());
        assert!(!TriggerType::EventBus.is_http());
    }

    #[test]
    fn test_path_normalization() {
        assert_eq!(normalize_path("v1/users".into()), "/v1/users");
        assert_eq!(normalize_path("/v1/users/".into()), "/v1/users");
        assert_eq!(normalize_path("/".into()), "/");
        assert_eq!(normalize_path("".into()), "/");
    }

    #[test]
    fn test_header_case_insensitivity() {
        let mut req = Request::new("get", "/x", TriggerType::HttpV2);
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        req.set_headers(headers);

        assert_eq!(req.method(), "GET");
        assert_eq!(req.header("content-type"), Some("application/json"));
        assert_eq!(req.header("CONTENT-TYPE"), Some("application/json"));
    }

    #[test]
    fn test_body_json_parse() {
        let mut req = Request::new("POST", "/x", TriggerType::HttpV1);
        req.set_body(br#"{"id": "abc"}"#.to_vec(), false);

        let parsed: serde_json::Value = req.parse_json().unwrap();
        assert_eq!(parsed["id"], "abc");

        req.set_body(b"not json".to_vec(), false);
        let err = req.parse_json::<serde_json::Value>().unwrap_err();
        assert_eq!(err.code.as_str(), "BAD_REQUEST");
    }
}
