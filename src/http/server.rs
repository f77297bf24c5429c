//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create the Axum router with the gateway, realtime and health handlers
//! - Wire up middleware (request ID, tracing, limits, identity, rate limit)
//! - Resolve routes and hand requests to the dispatcher
//! - Serve over plain TCP or TLS with graceful shutdown
//!
//! # Middleware Order (outermost first)
//! ```text
//! SetRequestId → PropagateRequestId → Trace → in-flight limit → BodyLimit → Timeout
//!     /api: identity → route resolution → rate limit → gateway_handler
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::{to_bytes, Body},
    extract::State,
    http::{HeaderName, Method, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{any, get},
    Extension, Json, Router,
};
use axum_server::tls_rustls::RustlsConfig;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Semaphore};
use tower_http::{
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::config::GatewayConfig;
use crate::dispatch::{DispatchOptions, DispatchRequest, Dispatcher, Notify};
use crate::http::request::{forwardable_headers, request_id, X_REQUEST_ID};
use crate::http::response::error_response;
use crate::http::websocket::ws_handler;
use crate::observability::metrics;
use crate::realtime::FanoutHub;
use crate::routing::{RouteMatch, RouteTable};
use crate::security::identity::{identity_middleware, Identity, IdentityProvider};
use crate::security::rate_limit::{rate_limit_middleware, RateLimiter};

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub routes: Arc<RouteTable>,
    pub hub: Arc<FanoutHub>,
    pub identity: Arc<dyn IdentityProvider>,
    pub limiter: Arc<RateLimiter>,
    pub config: Arc<GatewayConfig>,
}

/// Public HTTP server for the gateway.
pub struct HttpServer {
    router: Router,
    grace: Duration,
}

impl HttpServer {
    pub fn new(state: AppState) -> Self {
        let grace = Duration::from_secs(state.config.timeouts.shutdown_grace_secs);
        Self {
            router: build_router(state),
            grace,
        }
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Serve plain HTTP until `shutdown` fires.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    /// Serve HTTPS until `shutdown` fires, then drain for the grace period.
    pub async fn run_tls(
        self,
        addr: SocketAddr,
        tls: RustlsConfig,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        tracing::info!(address = %addr, "HTTPS server starting");

        let handle = axum_server::Handle::new();
        let drain = handle.clone();
        let grace = self.grace;
        tokio::spawn(async move {
            let _ = shutdown.recv().await;
            drain.graceful_shutdown(Some(grace));
        });

        axum_server::bind_rustls(addr, tls)
            .handle(handle)
            .serve(self.router.into_make_service_with_connect_info::<SocketAddr>())
            .await?;

        tracing::info!("HTTPS server stopped");
        Ok(())
    }
}

/// Build the public router with all middleware layers.
#[allow(deprecated)]
pub fn build_router(state: AppState) -> Router {
    let config = state.config.clone();
    let x_request_id = HeaderName::from_static(X_REQUEST_ID);

    // route_layer: last added runs first
    let api = Router::new()
        .route("/api/{*path}", any(gateway_handler))
        .route_layer(middleware::from_fn_with_state(
            state.limiter.clone(),
            rate_limit_middleware,
        ))
        .route_layer(middleware::from_fn_with_state(
            state.routes.clone(),
            route_middleware,
        ))
        .route_layer(middleware::from_fn_with_state(
            state.identity.clone(),
            identity_middleware,
        ));

    let mut router = api.route("/health", get(health_handler));
    if config.realtime.enabled {
        router = router.route("/ws", get(ws_handler));
    }

    router
        .with_state(state)
        .layer(TimeoutLayer::new(Duration::from_secs(config.timeouts.request_secs)))
        .layer(RequestBodyLimitLayer::new(config.security.max_body_size))
        .layer(middleware::from_fn_with_state(
            Arc::new(Semaphore::new(config.listener.max_connections)),
            inflight_limit,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::new(x_request_id.clone()))
        .layer(SetRequestIdLayer::new(x_request_id, MakeRequestUuid))
}

/// Shed load once `listener.max_connections` requests are in flight.
async fn inflight_limit(
    State(permits): State<Arc<Semaphore>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    match permits.try_acquire_owned() {
        Ok(permit) => {
            let response = next.run(request).await;
            drop(permit);
            response
        }
        Err(_) => {
            tracing::warn!(path = %request.uri().path(), "In-flight limit reached, shedding request");
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "overloaded",
                "gateway is at capacity, retry later",
            )
        }
    }
}

/// Resolve the route once and share it with later layers.
async fn route_middleware(
    State(routes): State<Arc<RouteTable>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    match routes.resolve(request.method(), request.uri().path()) {
        Some(matched) => {
            request.extensions_mut().insert(matched);
            next.run(request).await
        }
        None => {
            tracing::debug!(
                method = %request.method(),
                path = %request.uri().path(),
                "No route matched"
            );
            error_response(StatusCode::NOT_FOUND, "no_route", "no route matches this request")
        }
    }
}

/// Forward a routed request through the dispatcher.
async fn gateway_handler(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Extension(matched): Extension<RouteMatch>,
    request: Request<Body>,
) -> Response {
    let start = Instant::now();
    let request_id = request_id(request.headers());
    let route = matched.route.clone();
    let (parts, body) = request.into_parts();
    let method = parts.method.clone();

    let body = match to_bytes(body, state.config.security.max_body_size).await {
        Ok(body) => body,
        Err(_) => {
            return error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                "payload_too_large",
                "request body exceeds the configured limit",
            )
        }
    };

    let path = match parts.uri.query() {
        Some(query) => format!("{}?{}", matched.forward_path, query),
        None => matched.forward_path.clone(),
    };

    let mut options = DispatchOptions::default().scoped_to(identity.tenant_id.clone());
    if let Some(ttl) = route.cache_ttl_secs.filter(|_| matches!(method, Method::GET | Method::HEAD)) {
        options = options.cached(Duration::from_secs(ttl), route.cache_tags.clone());
    }
    if !route.invalidate_tags.is_empty() {
        options = options.invalidating(route.invalidate_tags.clone());
    }
    if let Some(topic) = &route.notify_topic {
        options = options.notifying(Notify {
            tenant_id: identity.tenant_id.clone(),
            topic: topic.clone(),
            event: route
                .notify_event
                .clone()
                .unwrap_or_else(|| format!("{}.updated", route.name)),
        });
    }
    if let Some(ms) = route.timeout_ms {
        options = options.with_timeout(Duration::from_millis(ms));
    }

    let headers = forwardable_headers(&parts.headers, &identity, &state.config.identity);
    let dispatch = match DispatchRequest::new(
        route.backend.clone(),
        method.clone(),
        path,
        headers,
        body,
        options,
    ) {
        Ok(dispatch) => dispatch,
        Err(e) => return e.into_response(),
    };

    tracing::debug!(
        request_id = %request_id,
        route = %route.name,
        backend = %route.backend,
        method = %method,
        "Dispatching request"
    );

    let response = match state.dispatcher.dispatch(dispatch).await {
        Ok(response) => response.into_response(),
        Err(e) => {
            tracing::warn!(
                request_id = %request_id,
                backend = %route.backend,
                error = %e,
                "Dispatch failed"
            );
            e.into_response()
        }
    };

    metrics::record_request(method.as_str(), response.status().as_u16(), &route.backend, start);
    response
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let cache_degraded = state.dispatcher.cache().is_degraded();
    let hub = state.hub.stats();
    Json(json!({
        "status": "ok",
        "open_circuits": state.dispatcher.breakers().open_count(),
        "cache_degraded": cache_degraded,
        "rate_limit_degraded": state.limiter.is_degraded(),
        "backbone_degraded": hub.backbone_degraded,
        "connections": hub.connections,
    }))
}
