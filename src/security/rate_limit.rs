//! Fixed-window rate limiting per caller and route class.
//!
//! Windows live in the shared store when one is configured, so every
//! gateway instance counts against the same budget. When the store is
//! unreachable the limiter falls back to in-process windows.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderValue, Method, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use tokio::time::Instant;

use crate::config::{RateClassConfig, RateLimitConfig};
use crate::observability::metrics;
use crate::routing::RouteMatch;
use crate::security::identity::Identity;
use crate::store::{RedisStore, StoreError, StoreHealth};

pub const DEFAULT_CLASS: &str = "default";
pub const WRITE_CLASS: &str = "write";

/// Limit applied to one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatePolicy {
    pub class: String,
    pub limit: u64,
    pub window: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { limit: u64, remaining: u64 },
    Limited { limit: u64, retry_after: Duration },
}

/// A rejected request. Rendered as 429 by the HTTP layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimited {
    pub class: String,
    pub limit: u64,
    pub retry_after: Duration,
}

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    count: u64,
    started: Instant,
    window: Duration,
}

pub struct RateLimiter {
    enabled: bool,
    classes: BTreeMap<String, RateClassConfig>,
    windows: DashMap<String, RateWindow>,
    store: Option<RedisStore>,
    health: StoreHealth,
    max_window: Duration,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig, store: Option<RedisStore>, retry_after: Duration) -> Self {
        Self {
            enabled: config.enabled,
            classes: config.classes.clone(),
            windows: DashMap::new(),
            store: if config.use_store { store } else { None },
            health: StoreHealth::new("rate_limit", retry_after),
            max_window: config.max_window(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_degraded(&self) -> bool {
        self.health.is_degraded()
    }

    /// Policy for a class name; unknown classes use `default`.
    pub fn policy(&self, class: &str) -> RatePolicy {
        let (name, limits) = match self.classes.get_key_value(class) {
            Some((name, limits)) => (name.clone(), *limits),
            None => match self.classes.get(DEFAULT_CLASS) {
                Some(limits) => (DEFAULT_CLASS.to_string(), *limits),
                None => (
                    DEFAULT_CLASS.to_string(),
                    RateClassConfig { limit: u64::MAX, window_secs: 60 },
                ),
            },
        };
        RatePolicy {
            class: name,
            limit: limits.limit,
            window: limits.window(),
        }
    }

    /// Count one request for `identity` and decide whether it may proceed.
    pub async fn check(&self, identity: &str, policy: &RatePolicy) -> RateDecision {
        if !self.enabled {
            return RateDecision::Allowed {
                limit: policy.limit,
                remaining: policy.limit,
            };
        }

        if let Some(store) = &self.store {
            if self.health.should_try() {
                match check_shared(store, identity, policy).await {
                    Ok(decision) => {
                        self.health.record_ok();
                        return decision;
                    }
                    Err(e) => self.health.record_err(&e),
                }
            }
        }

        self.check_local(identity, policy)
    }

    fn check_local(&self, identity: &str, policy: &RatePolicy) -> RateDecision {
        let now = Instant::now();
        let key = format!("{}:{}", policy.class, identity);
        let mut window = self.windows.entry(key).or_insert(RateWindow {
            count: 0,
            started: now,
            window: policy.window,
        });

        let elapsed = now.duration_since(window.started);
        if elapsed >= policy.window {
            *window = RateWindow {
                count: 1,
                started: now,
                window: policy.window,
            };
        } else {
            window.count = window.count.saturating_add(1);
        }

        decide(window.count, policy, policy.window.saturating_sub(now.duration_since(window.started)))
    }

    /// Evict windows older than the largest configured window.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        let max_window = self.max_window;
        self.windows
            .retain(|_, w| now.duration_since(w.started) < w.window.max(max_window));
        before.saturating_sub(self.windows.len())
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }
}

fn decide(count: u64, policy: &RatePolicy, retry_after: Duration) -> RateDecision {
    if count > policy.limit {
        RateDecision::Limited {
            limit: policy.limit,
            retry_after,
        }
    } else {
        RateDecision::Allowed {
            limit: policy.limit,
            remaining: policy.limit - count,
        }
    }
}

async fn check_shared(store: &RedisStore, identity: &str, policy: &RatePolicy) -> Result<RateDecision, StoreError> {
    let window_ms = policy.window.as_millis().max(1) as u64;
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let index = now_ms / window_ms;
    let key = store.key(&["rl", &policy.class, identity, &index.to_string()]);

    let count: u64 = store
        .run(|mut conn| async move {
            let (count,): (u64,) = ::redis::pipe()
                .atomic()
                .incr(&key, 1u64)
                .pexpire(&key, window_ms as i64)
                .ignore()
                .query_async(&mut conn)
                .await?;
            Ok(count)
        })
        .await?;

    let window_end = (index + 1) * window_ms;
    Ok(decide(count, policy, Duration::from_millis(window_end.saturating_sub(now_ms))))
}

/// Class for a request: the route's class, else `write` for
/// non-idempotent methods, else `default`.
pub fn class_for(route: Option<&RouteMatch>, method: &Method) -> String {
    if let Some(class) = route.and_then(|m| m.route.rate_class.clone()) {
        return class;
    }
    match *method {
        Method::GET | Method::HEAD | Method::OPTIONS => DEFAULT_CLASS.to_string(),
        _ => WRITE_CLASS.to_string(),
    }
}

/// Middleware enforcing the limiter after identity and route resolution.
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !limiter.is_enabled() {
        return next.run(request).await;
    }

    let key = match request.extensions().get::<Identity>() {
        Some(identity) => identity.key(),
        None => request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "anonymous".to_string()),
    };
    let class = class_for(request.extensions().get::<RouteMatch>(), request.method());
    let policy = limiter.policy(&class);

    match limiter.check(&key, &policy).await {
        RateDecision::Allowed { limit, remaining } => {
            let mut response = next.run(request).await;
            let headers = response.headers_mut();
            headers.insert("x-ratelimit-limit", HeaderValue::from(limit));
            headers.insert("x-ratelimit-remaining", HeaderValue::from(remaining));
            response
        }
        RateDecision::Limited { limit, retry_after } => {
            tracing::warn!(client = %key, class = %policy.class, "Rate limit exceeded");
            metrics::record_rate_limited(&policy.class);
            RateLimited {
                class: policy.class,
                limit,
                retry_after,
            }
            .into_response()
        }
    }
}
