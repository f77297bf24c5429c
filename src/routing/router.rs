//! Route lookup.
//!
//! # Responsibilities
//! - Store compiled routes
//! - Look up matching route for a method and path
//! - Return matched route or explicit no-match
//!
//! # Design Decisions
//! - Immutable after construction (thread-safe without locks)
//! - O(n) prefix scan (acceptable for typical route counts)
//! - Order: priority descending, then longest prefix, then declaration order

use std::sync::Arc;

use axum::http::Method;

use crate::config::RouteConfig;
use crate::routing::matcher::{AndMatcher, Matcher, MethodMatcher, PathPrefixMatcher};

#[derive(Debug)]
struct CompiledRoute {
    config: Arc<RouteConfig>,
    prefix: PathPrefixMatcher,
    matcher: AndMatcher,
}

/// A resolved route plus the path to forward to the backend.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub route: Arc<RouteConfig>,
    pub forward_path: String,
}

#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<CompiledRoute>,
}

impl RouteTable {
    /// Compile routes. Methods are assumed validated; unparseable ones are skipped.
    pub fn new(routes: &[RouteConfig]) -> Self {
        let mut compiled: Vec<CompiledRoute> = routes
            .iter()
            .map(|config| {
                let methods = config
                    .methods
                    .iter()
                    .filter_map(|m| m.to_ascii_uppercase().parse::<Method>().ok())
                    .collect();
                CompiledRoute {
                    config: Arc::new(config.clone()),
                    prefix: PathPrefixMatcher::new(config.path_prefix.as_str()),
                    matcher: AndMatcher::new(vec![
                        Box::new(PathPrefixMatcher::new(config.path_prefix.as_str())),
                        Box::new(MethodMatcher::new(methods)),
                    ]),
                }
            })
            .collect();

        // stable sort keeps declaration order among equals
        compiled.sort_by(|a, b| {
            b.config
                .priority
                .cmp(&a.config.priority)
                .then_with(|| b.prefix.prefix().len().cmp(&a.prefix.prefix().len()))
        });

        Self { routes: compiled }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn resolve(&self, method: &Method, path: &str) -> Option<RouteMatch> {
        let route = self.routes.iter().find(|r| r.matcher.matches(method, path))?;
        let forward_path = if route.config.strip_prefix {
            route.prefix.strip(path).to_string()
        } else {
            path.to_string()
        };
        Some(RouteMatch {
            route: route.config.clone(),
            forward_path,
        })
    }
}
