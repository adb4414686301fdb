//! Event-bus and scheduled-trigger adapters
//!
//! Bus events route on the event source (`/{source}`); scheduled triggers
//! route on the rule name extracted from the first resource ARN. The request
//! body carries the serialized `detail` payload, which is what typed
//! handlers want to parse.

use serde_json::{Map, Value};

use crate::error::{LiftError, Result};
use crate::request::{Request, TriggerType};

use super::records::EVENT_METHOD;

pub(super) fn adapt(raw: Value, trigger: TriggerType) -> Result<Request> {
    let source = raw
        .get("source")
        .and_then(Value::as_str)
        .ok_or_else(|| LiftError::bad_request("bus event missing source"))?;

    let path = match trigger {
        TriggerType::Scheduled => format!("/{}", rule_name(&raw).unwrap_or("scheduled")),
        _ => format!("/{source}"),
    };

    let mut request = Request::new(EVENT_METHOD, path, trigger);

    let mut metadata = Map::new();
    for field in ["id", "detail-type", "source", "time", "resources"] {
        if let Some(v) = raw.get(field) {
            metadata.insert(field.to_string(), v.clone());
        }
    }
    request.set_metadata(metadata);

    let body = match raw.get("detail") {
        Some(detail) => serde_json::to_vec(detail).map_err(LiftError::unclassified)?,
        None => Vec::new(),
    };
    request.set_body(body, false);

    Ok(request)
}

/// Rule name from the first resource ARN (`...rule/name`)
fn rule_name(raw: &Value) -> Option<&str> {
    raw.get("resources")
        .and_then(Value::as_array)
        .and_then(|r| r.first())
        .and_then(Value::as_str)
        .and_then(|arn| arn.rsplit('/').next())
}
