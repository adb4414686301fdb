//! Response cache middleware
//!
//! Computes a cache key per request, short-circuits with the stored status
//! and body on a hit, and on a miss buffers the response (declared via
//! [`Middleware::buffers_response`]) and stores it when the configured
//! predicate accepts it. The key function is fully caller-specified; include
//! tenant identity in it when cached data is tenant-scoped.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use http::StatusCode;

use crate::context::Context;
use crate::error::Result;
use crate::middleware::{Middleware, Next};
use crate::response::{Body, Response};

/// Derives the cache key for a request
pub type CacheKeyFn = Arc<dyn Fn(&Context) -> String + Send + Sync>;

/// Decides whether a completed response may be stored
pub type StorePredicate = Arc<dyn Fn(&Response) -> bool + Send + Sync>;

/// Stored response snapshot
#[derive(Debug, Clone)]
pub struct CachedResponse {
    /// Response status
    pub status: StatusCode,
    /// Response headers
    pub headers: Vec<(String, String)>,
    /// Response body
    pub body: Body,
}

/// Backing store for cached responses
pub trait ResponseCacheStore: Send + Sync + 'static {
    /// Fetch a fresh entry
    fn get(&self, key: &str) -> Option<CachedResponse>;

    /// Store an entry with a lifetime
    fn put(&self, key: &str, response: CachedResponse, ttl: Duration);
}

struct CacheEntry {
    response: CachedResponse,
    expires_at: Instant,
}

/// Process-local store backed by a concurrent map
#[derive(Default)]
pub struct InMemoryResponseCache {
    entries: DashMap<String, CacheEntry>,
}

impl InMemoryResponseCache {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResponseCacheStore for InMemoryResponseCache {
    fn get(&self, key: &str) -> Option<CachedResponse> {
        let entry = self.entries.get(key)?;
        if entry.expires_at <= Instant::now() {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(entry.response.clone())
    }

    fn put(&self, key: &str, response: CachedResponse, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                response,
                expires_at: Instant::now() + ttl,
            },
        );
    }
}

/// Default key: method, path, and sorted query parameters
pub fn default_cache_key(ctx: &Context) -> String {
    let mut query: Vec<_> = ctx
        .request()
        .query_params()
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    query.sort();
    format!("{} {}?{}", ctx.method(), ctx.path(), query.join("&"))
}

/// Configuration for [`ResponseCache`]
#[derive(Clone)]
pub struct CacheConfig {
    /// Entry lifetime
    pub ttl: Duration,
    /// Key derivation
    pub key_fn: CacheKeyFn,
    /// Storage predicate; defaults to successful statuses only
    pub store_predicate: StorePredicate,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            key_fn: Arc::new(default_cache_key),
            store_predicate: Arc::new(|resp: &Response| resp.status().is_success()),
        }
    }
}

impl CacheConfig {
    /// Default configuration (60s TTL, method+path+query key)
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the entry lifetime
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Replace the key function
    pub fn with_key_fn(mut self, key_fn: CacheKeyFn) -> Self {
        self.key_fn = key_fn;
        self
    }

    /// Replace the storage predicate
    pub fn with_store_predicate(mut self, predicate: StorePredicate) -> Self {
        self.store_predicate = predicate;
        self
    }
}

/// Response cache middleware
pub struct ResponseCache {
    config: CacheConfig,
    store: Arc<dyn ResponseCacheStore>,
}

impl ResponseCache {
    /// Cache with the in-memory store
    pub fn new(config: CacheConfig) -> Self {
        Self::with_store(config, Arc::new(InMemoryResponseCache::new()))
    }

    /// Cache with a custom backing store
    pub fn with_store(config: CacheConfig, store: Arc<dyn ResponseCacheStore>) -> Self {
        Self { config, store }
    }
}

#[async_trait]
impl Middleware for ResponseCache {
    async fn handle(&self, ctx: Context, next: Next<'_>) -> Result<()> {
        let key = (self.config.key_fn)(&ctx);

        if let Some(cached) = self.store.get(&key) {
            ctx.with_response(|resp| {
                for (name, value) in &cached.headers {
                    resp.set_header(name, value.clone());
                }
                resp.set_header("x-cache", "hit");
                resp.force_write(cached.status, cached.body.clone());
            });
            return Ok(());
        }

        next.run(ctx.clone()).await?;

        let snapshot = ctx.response_snapshot();
        if snapshot.is_written() && (self.config.store_predicate)(&snapshot) {
            self.store.put(
                &key,
                CachedResponse {
                    status: snapshot.status(),
                    headers: snapshot
                        .headers()
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                    body: snapshot.body().clone(),
                },
                self.config.ttl,
            );
        }
        ctx.set_header("x-cache", "miss");
        Ok(())
    }

    fn buffers_response(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "cache"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{handler_fn, Handler};
    use crate::request::{Request, TriggerType};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn ctx(path: &str) -> Context {
        let c = Context::new(Request::new("GET", path, TriggerType::HttpV2), None);
        // Runtime buffers the response when the chain contains this middleware
        c.with_response(|r| r.set_buffered(true));
        c
    }

    fn counting_handler(hits: Arc<AtomicU32>) -> Arc<dyn Handler> {
        Arc::new(handler_fn(move |ctx: Context| {
            let hits = hits.clone();
            async move {
                let n = hits.fetch_add(1, Ordering::SeqCst) + 1;
                ctx.json(&json!({ "n": n }))
            }
        }))
    }

    #[tokio::test]
    async fn test_hit_short_circuits() {
        let chain: Vec<Arc<dyn Middleware>> =
            vec![Arc::new(ResponseCache::new(CacheConfig::new()))];
        let hits = Arc::new(AtomicU32::new(0));
        let handler = counting_handler(hits.clone());

        let first = ctx("/items");
        Next::new(&chain, &handler).run(first.clone()).await.unwrap();
        assert_eq!(first.response_snapshot().body().to_wire_string(), r#"{"n":1}"#);

        let second = ctx("/items");
        Next::new(&chain, &handler).run(second.clone()).await.unwrap();
        let resp = second.response_snapshot();
        assert_eq!(resp.body().to_wire_string(), r#"{"n":1}"#);
        assert_eq!(resp.header("x-cache"), Some("hit"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_miss() {
        let chain: Vec<Arc<dyn Middleware>> =
            vec![Arc::new(ResponseCache::new(CacheConfig::new()))];
        let hits = Arc::new(AtomicU32::new(0));
        let handler = counting_handler(hits.clone());

        Next::new(&chain, &handler).run(ctx("/a")).await.unwrap();
        Next::new(&chain, &handler).run(ctx("/b")).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_error_responses_not_stored() {
        let chain: Vec<Arc<dyn Middleware>> =
            vec![Arc::new(ResponseCache::new(CacheConfig::new()))];
        let hits = Arc::new(AtomicU32::new(0));
        let hits2 = hits.clone();
        let handler: Arc<dyn Handler> = Arc::new(handler_fn(move |_ctx| {
            let hits = hits2.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Err(crate::error::LiftError::not_found("nope"))
            }
        }));

        let _ = Next::new(&chain, &handler).run(ctx("/missing")).await;
        let _ = Next::new(&chain, &handler).run(ctx("/missing")).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_expired_entries_refetch() {
        let chain: Vec<Arc<dyn Middleware>> = vec![Arc::new(ResponseCache::new(
            CacheConfig::new().with_ttl(Duration::from_millis(10)),
        ))];
        let hits = Arc::new(AtomicU32::new(0));
        let handler = counting_handler(hits.clone());

        Next::new(&chain, &handler).run(ctx("/items")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        Next::new(&chain, &handler).run(ctx("/items")).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_default_key_sorts_query() {
        let mut req = Request::new("GET", "/items", TriggerType::HttpV2);
        let mut query = std::collections::HashMap::new();
        query.insert("b".to_string(), "2".to_string());
        query.insert("a".to_string(), "1".to_string());
        req.set_query(query);
        let ctx = Context::new(req, None);
        assert_eq!(default_cache_key(&ctx), "GET /items?a=1&b=2");
    }
}
