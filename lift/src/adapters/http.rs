//! HTTP gateway adapters (payload formats v1 and v2)

use serde_json::Value;

use crate::error::{LiftError, Result};
use crate::request::{Request, TriggerType};

use super::{decode_body, object_metadata, string_map};

/// Normalize an HTTP v2 gateway payload
///
/// Applies the only path rewrite the framework performs: when custom-domain
/// base-path mapping puts the stage into the path (`/{stage}/...`) and the
/// stage is not the `$default` token, the prefix is stripped so route
/// patterns stay invariant to the deployment channel.
pub(super) fn adapt_v2(raw: Value) -> Result<Request> {
    let method = raw
        .pointer("/requestContext/http/method")
        .and_then(Value::as_str)
        .ok_or_else(|| LiftError::bad_request("http-v2 event missing request method"))?;

    let path = raw
        .get("rawPath")
        .and_then(Value::as_str)
        .or_else(|| raw.pointer("/requestContext/http/path").and_then(Value::as_str))
        .unwrap_or("/");

    let stage = raw
        .pointer("/requestContext/stage")
        .and_then(Value::as_str)
        .unwrap_or("");
    let path = strip_stage_prefix(path, stage);

    let mut request = Request::new(method, path, TriggerType::HttpV2);
    request.set_headers(string_map(raw.get("headers")));
    request.set_query(string_map(raw.get("queryStringParameters")));

    let (body, was_base64) = decode_body(&raw)?;
    request.set_body(body, was_base64);
    request.set_metadata(object_metadata(raw.get("requestContext")));

    Ok(request)
}

/// Normalize an HTTP v1 gateway payload
///
/// v1 does not include the stage in the path, so no stage stripping applies.
pub(super) fn adapt_v1(raw: Value) -> Result<Request> {
    let method = raw
        .get("httpMethod")
        .and_then(Value::as_str)
        .ok_or_else(|| LiftError::bad_request("http-v1 event missing httpMethod"))?;

    let path = raw.get("path").and_then(Value::as_str).unwrap_or("/");

    let mut request = Request::new(method, path, TriggerType::HttpV1);

    // Single-value headers first, then comma-join any multi-value entries
    let mut headers = string_map(raw.get("headers"));
    if let Some(Value::Object(multi)) = raw.get("multiValueHeaders") {
        for (name, values) in multi {
            if let Some(values) = values.as_array() {
                let joined: Vec<&str> = values.iter().filter_map(Value::as_str).collect();
                if joined.len() > 1 {
                    headers.insert(name.clone(), joined.join(","));
                }
            }
        }
    }
    request.set_headers(headers);

    request.set_query(string_map(raw.get("queryStringParameters")));
    if let Some(Value::Object(multi)) = raw.get("multiValueQueryStringParameters") {
        let mut multi_query = std::collections::HashMap::new();
        for (name, values) in multi {
            if let Some(values) = values.as_array() {
                multi_query.insert(
                    name.clone(),
                    values
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect(),
                );
            }
        }
        request.set_multi_query(multi_query);
    }

    let (body, was_base64) = decode_body(&raw)?;
    request.set_body(body, was_base64);
    request.set_metadata(object_metadata(raw.get("requestContext")));

    Ok(request)
}

/// Strip `/{stage}` from the front of the path when the stage is a real
/// deployment channel (not `$default`) and the path actually carries it
fn strip_stage_prefix(path: &str, stage: &str) -> String {
    if stage.is_empty() || stage == "$default" {
        return path.to_string();
    }
    let prefix = format!("/{stage}");
    if let Some(rest) = path.strip_prefix(&prefix) {
        if rest.is_empty() {
            return "/".to_string();
        }
        if rest.starts_with('/') {
            return rest.to_string();
        }
    }
    path.to_string()
}
