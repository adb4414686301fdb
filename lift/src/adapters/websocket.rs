//! WebSocket gateway adapter
//!
//! WebSocket routes are registered under the `WEBSOCKET` pseudo-method with
//! the route key as the path (`/$connect`, `/$disconnect`, `/$default`, or a
//! custom route). The connection id travels in the request metadata.

use serde_json::Value;

use crate::error::{LiftError, Result};
use crate::request::{Request, TriggerType};

use super::{decode_body, object_metadata, string_map};

/// Pseudo-method for WebSocket routes
pub const WEBSOCKET_METHOD: &str = "WEBSOCKET";

pub(super) fn adapt(raw: Value) -> Result<Request> {
    let route_key = raw
        .pointer("/requestContext/routeKey")
        .and_then(Value::as_str)
        .ok_or_else(|| LiftError::bad_request("websocket event missing routeKey"))?;

    let mut request = Request::new(WEBSOCKET_METHOD, format!("/{route_key}"), TriggerType::WebSocket);

    request.set_headers(string_map(raw.get("headers")));

    // Query parameters arrive in a dedicated top-level field and MUST be
    // propagated; $connect auth tokens commonly travel here.
    request.set_query(string_map(raw.get("queryStringParameters")));

    let (body, was_base64) = decode_body(&raw)?;
    request.set_body(body, was_base64);
    request.set_metadata(object_metadata(raw.get("requestContext")));

    Ok(request)
}
