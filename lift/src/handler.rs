//! Handler shapes
//!
//! Users write either untyped handlers (`async fn(Context) -> Result<()>`
//! via [`handler_fn`]) or typed handlers ([`typed_handler`]) that receive a
//! deserialized, validated request type and return a serializable response
//! type. Both reduce to the one internal [`Handler`] shape the runtime
//! dispatches.

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use crate::context::Context;
use crate::error::{LiftError, Result};

/// Internal handler shape dispatched by the runtime
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Process one invocation; write the response through the context
    async fn call(&self, ctx: Context) -> Result<()>;
}

/// Adapt a plain async function or closure into a [`Handler`]
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    FnHandler { f }
}

/// Wrapper produced by [`handler_fn`]
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn call(&self, ctx: Context) -> Result<()> {
        (self.f)(ctx).await
    }
}

/// Adapt a typed function into a [`Handler`]
///
/// The shim reads the request body, deserializes it into `T`, validates the
/// declared field constraints, invokes the function, and serializes the
/// returned value as the JSON response with status 200. An empty body
/// deserializes from the empty object, so types whose fields are optional
/// or defaulted accept bodyless requests.
pub fn typed_handler<T, R, F, Fut>(f: F) -> TypedHandler<T, R, F>
where
    T: DeserializeOwned + garde::Validate + Send + 'static,
    T::Context: Default,
    R: Serialize + Send + 'static,
    F: Fn(Context, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    TypedHandler {
        f,
        _marker: PhantomData,
    }
}

/// Wrapper produced by [`typed_handler`]
pub struct TypedHandler<T, R, F> {
    f: F,
    _marker: PhantomData<fn(T) -> R>,
}

#[async_trait]
impl<T, R, F, Fut> Handler for TypedHandler<T, R, F>
where
    T: DeserializeOwned + garde::Validate + Send + 'static,
    T::Context: Default,
    R: Serialize + Send + 'static,
    F: Fn(Context, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    async fn call(&self, ctx: Context) -> Result<()> {
        let body = ctx.request().body();

        let value: T = if body.is_empty() {
            // Bodyless requests get the type's zero value; types with
            // mandatory fields surface that as a validation failure
            serde_json::from_str("{}").map_err(|e| {
                LiftError::validation("validation failed")
                    .with_detail("fields", json!([{ "field": field_from_serde(&e), "constraint": "required" }]))
            })?
        } else {
            serde_json::from_slice(body)
                .map_err(|e| LiftError::bad_request(format!("invalid request body: {e}")))?
        };

        value.validate().map_err(|report| validation_error(&report))?;

        let response = (self.f)(ctx.clone(), value).await?;
        ctx.json(&response)
    }
}

/// Convert a constraint report into the `VALIDATION_ERROR` detail shape
fn validation_error(report: &garde::Report) -> LiftError {
    let fields: Vec<Value> = report
        .iter()
        .map(|(path, error)| {
            let field = {
                let p = path.to_string();
                if p.is_empty() {
                    "value".to_string()
                } else {
                    p
                }
            };
            json!({ "field": field, "constraint": error.message().to_string() })
        })
        .collect();

    LiftError::validation("validation failed").with_detail("fields", Value::Array(fields))
}

/// Best-effort field name out of a serde "missing field" error
fn field_from_serde(err: &serde_json::Error) -> String {
    let msg = err.to_string();
    msg.split('`')
        .nth(1)
        .map(str::to_string)
        .unwrap_or_else(|| "body".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Request, TriggerType};
    use serde::Deserialize;

    #[derive(Debug, Deserialize, garde::Validate)]
    struct CreateUser {
        #[garde(required, inner(length(min = 1)))]
        name: Option<String>,
        #[garde(range(min = 0, max = 120))]
        #[serde(default)]
        age: i64,
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Created {
        id: String,
    }

    fn ctx_with_body(body: &[u8]) -> Context {
        let mut req = Request::new("POST", "/users", TriggerType::HttpV2);
        req.set_body(body.to_vec(), false);
        Context::new(req, None)
    }

    #[tokio::test]
    async fn test_typed_happy_path() {
        let handler = typed_handler(|_ctx: Context, user: CreateUser| async move {
            assert_eq!(user.name.as_deref(), Some("ada"));
            Ok(Created { id: "u-1".into() })
        });

        let ctx = ctx_with_body(br#"{"name":"ada","age":30}"#);
        handler.call(ctx.clone()).await.unwrap();

        let resp = ctx.response_snapshot();
        assert_eq!(resp.status().as_u16(), 200);
        assert_eq!(resp.body().to_wire_string(), r#"{"id":"u-1"}"#);
    }

    #[tokio::test]
    async fn test_typed_validation_failure() {
        let handler = typed_handler(|_ctx: Context, _user: CreateUser| async move {
            Ok(Created { id: "unreachable".into() })
        });

        let ctx = ctx_with_body(br#"{"age":-1}"#);
        let err = handler.call(ctx).await.unwrap_err();

        assert_eq!(err.code.as_str(), "VALIDATION_ERROR");
        assert_eq!(err.status.as_u16(), 422);
        let fields = err.details["fields"].as_array().unwrap();
        let named: Vec<&str> = fields
            .iter()
            .map(|f| f["field"].as_str().unwrap())
            .collect();
        assert!(named.contains(&"name"));
        assert!(named.contains(&"age"));
    }

    #[tokio::test]
    async fn test_typed_unparseable_body() {
        let handler = typed_handler(|_ctx: Context, _user: CreateUser| async move {
            Ok(Created { id: "unreachable".into() })
        });

        let ctx = ctx_with_body(b"not json");
        let err = handler.call(ctx).await.unwrap_err();
        assert_eq!(err.code.as_str(), "BAD_REQUEST");
        assert_eq!(err.status.as_u16(), 400);
    }

    #[derive(Debug, Default, Deserialize, garde::Validate)]
    struct OptionalFilter {
        #[garde(skip)]
        #[serde(default)]
        limit: Option<i64>,
    }

    #[tokio::test]
    async fn test_typed_empty_body_zero_value() {
        let handler = typed_handler(|_ctx: Context, filter: OptionalFilter| async move {
            assert!(filter.limit.is_none());
            Ok(json!({ "ok": true }))
        });

        let ctx = ctx_with_body(b"");
        handler.call(ctx.clone()).await.unwrap();
        assert_eq!(ctx.response_snapshot().status().as_u16(), 200);
    }

    #[tokio::test]
    async fn test_fn_handler() {
        let handler = handler_fn(|ctx: Context| async move { ctx.text("pong") });
        let ctx = ctx_with_body(b"");
        handler.call(ctx.clone()).await.unwrap();
        assert_eq!(ctx.response_snapshot().body().to_wire_string(), "pong");
    }
}
