//! Record-batch adapters: queue messages, object-store notifications, and
//! change-capture streams
//!
//! These sources deliver a `Records` array. The synthesized path is derived
//! from the event source (queue name, bucket/key, table or stream name) and
//! the method is the `EVENT` pseudo-method. The request body carries the
//! full raw event so handlers can walk every record; per-record identifiers
//! from the first record are preserved in the metadata.

use serde_json::{Map, Value};

use crate::error::{LiftError, Result};
use crate::request::{Request, TriggerType};

/// Pseudo-method for all non-HTTP event triggers
pub const EVENT_METHOD: &str = "EVENT";

pub(super) fn adapt_queue(raw: Value) -> Result<Request> {
    let first = first_record(&raw)?;
    let queue_name = first
        .get("eventSourceARN")
        .and_then(Value::as_str)
        .and_then(|arn| arn.rsplit(':').next())
        .unwrap_or("queue");

    let mut request = Request::new(EVENT_METHOD, format!("/{queue_name}"), TriggerType::Queue);

    let mut metadata = Map::new();
    copy_fields(first, &mut metadata, &["messageId", "receiptHandle", "eventSourceARN"]);
    record_count(&raw, &mut metadata);
    request.set_metadata(metadata);

    request.set_body(serialize_event(&raw)?, false);
    Ok(request)
}

pub(super) fn adapt_object_store(raw: Value) -> Result<Request> {
    let first = first_record(&raw)?;
    let bucket = first
        .pointer("/s3/bucket/name")
        .and_then(Value::as_str)
        .ok_or_else(|| LiftError::bad_request("object-store event missing bucket name"))?;
    let key = first
        .pointer("/s3/object/key")
        .and_then(Value::as_str)
        .ok_or_else(|| LiftError::bad_request("object-store event missing object key"))?;

    let mut request = Request::new(
        EVENT_METHOD,
        format!("/{bucket}/{key}"),
        TriggerType::ObjectStore,
    );

    let mut metadata = Map::new();
    copy_fields(first, &mut metadata, &["eventName", "eventTime", "awsRegion"]);
    metadata.insert("bucket".into(), Value::String(bucket.to_string()));
    metadata.insert("key".into(), Value::String(key.to_string()));
    record_count(&raw, &mut metadata);
    request.set_metadata(metadata);

    request.set_body(serialize_event(&raw)?, false);
    Ok(request)
}

pub(super) fn adapt_stream(raw: Value) -> Result<Request> {
    let first = first_record(&raw)?;
    let arn = first.get("eventSourceARN").and_then(Value::as_str).unwrap_or("");
    let name = stream_name(arn).unwrap_or("stream");

    let mut request = Request::new(EVENT_METHOD, format!("/{name}"), TriggerType::Stream);

    let mut metadata = Map::new();
    copy_fields(first, &mut metadata, &["eventID", "eventName", "eventSource", "eventSourceARN"]);
    record_count(&raw, &mut metadata);
    request.set_metadata(metadata);

    request.set_body(serialize_event(&raw)?, false);
    Ok(request)
}

fn first_record(raw: &Value) -> Result<&Value> {
    raw.get("Records")
        .and_then(Value::as_array)
        .and_then(|r| r.first())
        .ok_or_else(|| LiftError::bad_request("record event carries no records"))
}

fn serialize_event(raw: &Value) -> Result<Vec<u8>> {
    serde_json::to_vec(raw).map_err(LiftError::unclassified)
}

fn copy_fields(record: &Value, metadata: &mut Map<String, Value>, fields: &[&str]) {
    for field in fields {
        if let Some(v) = record.get(*field) {
            metadata.insert((*field).to_string(), v.clone());
        }
    }
}

fn record_count(raw: &Value, metadata: &mut Map<String, Value>) {
    let count = raw
        .get("Records")
        .and_then(Value::as_array)
        .map(|r| r.len())
        .unwrap_or(0);
    metadata.insert("recordCount".into(), Value::from(count));
}

/// Table name from a change-capture ARN (`...:table/Name/stream/...`) or
/// stream name from a shard-stream ARN (`...:stream/Name`)
fn stream_name(arn: &str) -> Option<&str> {
    if let Some(rest) = arn.split("table/").nth(1) {
        return rest.split('/').next();
    }
    if let Some(rest) = arn.split("stream/").nth(1) {
        return rest.split('/').next();
    }
    None
}
