//! Method + path routing with parameter capture
//!
//! Patterns are literal segments and `:name` parameter segments; no
//! wildcards. Ties between matching patterns prefer more literal segments,
//! then first registration. Segments are matched verbatim, with no
//! percent-decoding or case folding.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::error::{LiftError, Result};
use crate::handler::Handler;
use crate::middleware::Middleware;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

fn parse_pattern(pattern: &str) -> Vec<Segment> {
    pattern
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| match s.strip_prefix(':') {
            Some(name) => Segment::Param(name.to_string()),
            None => Segment::Literal(s.to_string()),
        })
        .collect()
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// A registered (method, pattern, handler) triple with its effective
/// route-level middleware
pub(crate) struct Route {
    method: String,
    pattern: String,
    segments: Vec<Segment>,
    handler: Arc<dyn Handler>,
    middleware: Vec<Arc<dyn Middleware>>,
}

/// Successful lookup: the handler, its route-level middleware, and the
/// captured path parameters
pub(crate) struct RouteMatch<'a> {
    pub handler: &'a Arc<dyn Handler>,
    pub middleware: &'a [Arc<dyn Middleware>],
    pub params: HashMap<String, String>,
}

impl std::fmt::Debug for RouteMatch<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteMatch")
            .field("params", &self.params)
            .finish()
    }
}

/// Route table for one application
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    /// Empty route table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route
    ///
    /// # Panics
    ///
    /// Panics when the (method, pattern) pair is already registered; route
    /// registration happens at startup and duplicates are programmer error.
    pub(crate) fn register(
        &mut self,
        method: &str,
        pattern: &str,
        handler: Arc<dyn Handler>,
        middleware: Vec<Arc<dyn Middleware>>,
    ) {
        let method = method.to_uppercase();
        let pattern = crate::request::normalize_path(pattern.to_string());
        if self
            .routes
            .iter()
            .any(|r| r.method == method && r.pattern == pattern)
        {
            panic!("route already registered: {method} {pattern}");
        }
        let segments = parse_pattern(&pattern);
        self.routes.push(Route {
            method,
            pattern,
            segments,
            handler,
            middleware,
        });
    }

    /// Number of registered routes
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Select the handler for (method, path) and bind captured parameters
    ///
    /// Fails with `NOT_FOUND` when no pattern matches the path and with
    /// `METHOD_NOT_ALLOWED` (carrying an `allow` detail) when patterns match
    /// the path under other methods only.
    pub(crate) fn find(&self, method: &str, path: &str) -> Result<RouteMatch<'_>> {
        let path_segments = split_path(path);

        let mut best: Option<(&Route, HashMap<String, String>, usize)> = None;
        let mut allowed: BTreeSet<&str> = BTreeSet::new();

        for route in &self.routes {
            let Some((params, literals)) = match_segments(&route.segments, &path_segments) else {
                continue;
            };
            if route.method != method {
                allowed.insert(route.method.as_str());
                continue;
            }
            // Prefer more literal segments; on a full tie the earliest
            // registration wins because we only replace on strictly-greater
            match &best {
                Some((_, _, best_literals)) if literals <= *best_literals => {}
                _ => best = Some((route, params, literals)),
            }
        }

        if let Some((route, params, _)) = best {
            return Ok(RouteMatch {
                handler: &route.handler,
                middleware: &route.middleware,
                params,
            });
        }

        if !allowed.is_empty() {
            let allow = allowed.into_iter().collect::<Vec<_>>().join(", ");
            return Err(
                LiftError::method_not_allowed(format!("{method} not permitted for {path}"))
                    .with_detail("allow", allow),
            );
        }

        Err(LiftError::not_found(format!("no route for {path}")))
    }
}

fn match_segments(
    pattern: &[Segment],
    path: &[&str],
) -> Option<(HashMap<String, String>, usize)> {
    if pattern.len() != path.len() {
        return None;
    }
    let mut params = HashMap::new();
    let mut literals = 0;
    for (segment, value) in pattern.iter().zip(path) {
        match segment {
            Segment::Literal(lit) => {
                if lit != value {
                    return None;
                }
                literals += 1;
            }
            Segment::Param(name) => {
                params.insert(name.clone(), (*value).to_string());
            }
        }
    }
    Some((params, literals))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;

    fn noop() -> Arc<dyn Handler> {
        Arc::new(handler_fn(|_ctx| async { Ok(()) }))
    }

    fn router_with(routes: &[(&str, &str)]) -> Router {
        let mut router = Router::new();
        for (method, pattern) in routes {
            router.register(method, pattern, noop(), Vec::new());
        }
        router
    }

    #[test]
    fn test_literal_match() {
        let router = router_with(&[("GET", "/health")]);
        let m = router.find("GET", "/health").unwrap();
        assert!(m.params.is_empty());
    }

    #[test]
    fn test_param_capture() {
        let router = router_with(&[("GET", "/v1/customers/:id")]);
        let m = router.find("GET", "/v1/customers/abc").unwrap();
        assert_eq!(m.params.get("id").map(String::as_str), Some("abc"));
    }

    #[test]
    fn test_all_param_segments() {
        let router = router_with(&[("GET", "/:a/:b/:c")]);
        let m = router.find("GET", "/x/y/z").unwrap();
        assert_eq!(m.params.len(), 3);
        assert_eq!(m.params.get("b").map(String::as_str), Some("y"));
    }

    #[test]
    fn test_segment_count_must_match() {
        let router = router_with(&[("GET", "/v1/customers/:id")]);
        assert!(router.find("GET", "/v1/customers").is_err());
        assert!(router.find("GET", "/v1/customers/abc/orders").is_err());
    }

    #[test]
    fn test_not_found() {
        let router = router_with(&[("GET", "/a")]);
        let err = router.find("GET", "/b").unwrap_err();
        assert_eq!(err.code.as_str(), "NOT_FOUND");
        assert_eq!(err.status.as_u16(), 404);
    }

    #[test]
    fn test_zero_routes() {
        let router = Router::new();
        assert!(router.is_empty());
        assert_eq!(router.find("GET", "/").unwrap_err().status.as_u16(), 404);
    }

    #[test]
    fn test_method_mismatch_lists_allowed() {
        let router = router_with(&[("GET", "/items"), ("POST", "/items"), ("GET", "/other")]);
        let err = router.find("DELETE", "/items").unwrap_err();
        assert_eq!(err.code.as_str(), "METHOD_NOT_ALLOWED");
        assert_eq!(err.status.as_u16(), 405);
        assert_eq!(err.details["allow"], "GET, POST");
    }

    #[test]
    fn test_method_is_case_sensitive_uppercase() {
        let router = router_with(&[("get", "/items")]);
        // registration uppercases; lookup is exact
        assert!(router.find("GET", "/items").is_ok());
        assert!(router.find("get", "/items").is_err());
    }

    #[test]
    fn test_tie_break_prefers_literals() {
        let mut router = Router::new();
        router.register("GET", "/users/:id", noop(), Vec::new());
        router.register("GET", "/users/me", noop(), Vec::new());

        let m = router.find("GET", "/users/me").unwrap();
        assert!(m.params.is_empty(), "literal pattern must win");

        let m = router.find("GET", "/users/u-1").unwrap();
        assert_eq!(m.params.get("id").map(String::as_str), Some("u-1"));
    }

    #[test]
    fn test_full_tie_first_registered_wins() {
        struct Marker(&'static str);
        #[async_trait::async_trait]
        impl Handler for Marker {
            async fn call(&self, ctx: crate::context::Context) -> Result<()> {
                ctx.text(self.0)
            }
        }

        let mut router = Router::new();
        router.register("GET", "/x/:a", Arc::new(Marker("first")), Vec::new());
        router.register("GET", "/x/:b", Arc::new(Marker("second")), Vec::new());

        let m = router.find("GET", "/x/1").unwrap();
        assert_eq!(m.params.get("a").map(String::as_str), Some("1"));
    }

    #[test]
    #[should_panic(expected = "route already registered")]
    fn test_duplicate_registration_panics() {
        let mut router = Router::new();
        router.register("GET", "/dup", noop(), Vec::new());
        router.register("GET", "/dup", noop(), Vec::new());
    }

    #[test]
    fn test_no_percent_decoding() {
        let router = router_with(&[("GET", "/files/:name")]);
        let m = router.find("GET", "/files/a%20b").unwrap();
        assert_eq!(m.params.get("name").map(String::as_str), Some("a%20b"));
    }
}
