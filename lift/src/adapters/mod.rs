//! Event-source adapters
//!
//! Adapters normalize heterogeneous raw payloads into a [`Request`]. Shape
//! detection is structural (presence and types of named keys) and ordered;
//! reordering the checks risks mis-routing because several shapes share keys
//! (both HTTP formats carry `requestContext`, several sources carry
//! `Records`). First match wins.

mod eventbus;
mod http;
mod records;
mod websocket;

pub use records::EVENT_METHOD;
pub use websocket::WEBSOCKET_METHOD;

use serde_json::Value;

use crate::error::{ErrorCode, LiftError, Result};
use crate::request::{Request, TriggerType};

/// Classify a raw payload by its structural markers
///
/// Check order is normative:
/// HTTP v2 (nested `requestContext.http`), HTTP v1 (top-level `httpMethod`),
/// WebSocket (`requestContext.routeKey` + `connectionId`), then the
/// `Records` family (queue, object store, stream), then event-bus shapes
/// (with `Scheduled Event` discriminated before the generic bus).
pub fn detect(raw: &Value) -> Option<TriggerType> {
    if !raw.is_object() {
        return None;
    }

    if raw
        .pointer("/requestContext/http")
        .is_some_and(Value::is_object)
    {
        return Some(TriggerType::HttpV2);
    }

    if raw.get("httpMethod").is_some_and(Value::is_string) {
        return Some(TriggerType::HttpV1);
    }

    if raw
        .pointer("/requestContext/routeKey")
        .is_some_and(Value::is_string)
        && raw
            .pointer("/requestContext/connectionId")
            .is_some_and(Value::is_string)
    {
        return Some(TriggerType::WebSocket);
    }

    if let Some(records) = raw.get("Records").and_then(Value::as_array) {
        let first = records.first()?;
        let source = first.get("eventSource").and_then(Value::as_str).unwrap_or("");

        if source.ends_with("sqs") {
            return Some(TriggerType::Queue);
        }
        if source.ends_with("s3") && first.get("s3").is_some_and(Value::is_object) {
            return Some(TriggerType::ObjectStore);
        }
        if source.ends_with("dynamodb")
            || source.ends_with("kinesis")
            || first.get("dynamodb").is_some_and(Value::is_object)
            || first.get("kinesis").is_some_and(Value::is_object)
        {
            return Some(TriggerType::Stream);
        }
        return None;
    }

    if raw.get("source").is_some_and(Value::is_string) && raw.get("detail-type").is_some() {
        if raw.get("detail-type").and_then(Value::as_str) == Some("Scheduled Event") {
            return Some(TriggerType::Scheduled);
        }
        return Some(TriggerType::EventBus);
    }

    None
}

/// Normalize a raw payload into a [`Request`]
///
/// Fails with `UNSUPPORTED_EVENT` when no structural marker matches and
/// `BAD_REQUEST` when a detected shape is missing mandatory fields or
/// carries an undecodable body.
pub fn adapt(raw: Value) -> Result<Request> {
    let trigger = detect(&raw).ok_or_else(|| {
        LiftError::new(
            ErrorCode::UnsupportedEvent,
            "event shape does not match any known trigger",
        )
    })?;

    match trigger {
        TriggerType::HttpV2 => http::adapt_v2(raw),
        TriggerType::HttpV1 => http::adapt_v1(raw),
        TriggerType::WebSocket => websocket::adapt(raw),
        TriggerType::Queue => records::adapt_queue(raw),
        TriggerType::ObjectStore => records::adapt_object_store(raw),
        TriggerType::Stream => records::adapt_stream(raw),
        TriggerType::EventBus => eventbus::adapt(raw, TriggerType::EventBus),
        TriggerType::Scheduled => eventbus::adapt(raw, TriggerType::Scheduled),
    }
}

/// Decode the `body`/`isBase64Encoded` pair shared by the gateway shapes
pub(crate) fn decode_body(raw: &Value) -> Result<(Vec<u8>, bool)> {
    use base64::Engine;

    let is_base64 = raw
        .get("isBase64Encoded")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let body = match raw.get("body") {
        Some(Value::String(s)) if is_base64 => base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(|e| LiftError::bad_request(format!("invalid base64 body: {e}")))?,
        Some(Value::String(s)) => s.clone().into_bytes(),
        Some(Value::Null) | None => Vec::new(),
        Some(other) => other.to_string().into_bytes(),
    };
    Ok((body, is_base64))
}

/// Flatten a JSON object of string values into a map
pub(crate) fn string_map(value: Option<&Value>) -> std::collections::HashMap<String, String> {
    let mut out = std::collections::HashMap::new();
    if let Some(Value::Object(obj)) = value {
        for (k, v) in obj {
            match v {
                Value::String(s) => {
                    out.insert(k.clone(), s.clone());
                }
                Value::Null => {}
                other => {
                    out.insert(k.clone(), other.to_string());
                }
            }
        }
    }
    out
}

/// Copy an object value into metadata verbatim
pub(crate) fn object_metadata(value: Option<&Value>) -> serde_json::Map<String, Value> {
    match value {
        Some(Value::Object(obj)) => obj.clone(),
        _ => serde_json::Map::new(),
    }
}
