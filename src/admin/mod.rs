//! Operator-facing admin surface, served on its own listener.

pub mod auth;
pub mod handlers;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::http::server::AppState;

pub fn setup_admin_router(state: AppState) -> Router {
    let api_key: Arc<str> = Arc::from(state.config.admin.api_key.as_str());
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/overview", get(get_overview))
        .route("/admin/circuits", get(get_circuits))
        .route("/admin/circuits/reset", post(reset_circuits))
        .route("/admin/circuits/{backend}/reset", post(reset_circuit))
        .route("/admin/cache", get(get_cache))
        .route("/admin/cache/flush", post(flush_cache))
        .route("/admin/cache/invalidate/{tag}", post(invalidate_tag))
        .route("/admin/cache/stats/reset", post(reset_cache_stats))
        .layer(middleware::from_fn_with_state(api_key, admin_auth_middleware))
        .with_state(state)
}
