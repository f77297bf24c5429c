use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::cache::CacheStats;
use crate::http::response::error_response;
use crate::http::server::AppState;
use crate::realtime::HubStats;
use crate::resilience::CircuitSnapshot;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct Overview {
    pub circuits: Vec<CircuitSnapshot>,
    pub open_circuits: usize,
    pub cache: CacheStats,
    pub hub: HubStats,
    pub rate_limit_degraded: bool,
    pub rate_windows: usize,
}

#[derive(Serialize)]
pub struct ResetResult {
    pub reset: usize,
}

pub async fn get_status(State(state): State<AppState>) -> Json<SystemStatus> {
    let status = if state.dispatcher.breakers().open_count() > 0 {
        "degraded"
    } else {
        "operational"
    };
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status,
    })
}

pub async fn get_overview(State(state): State<AppState>) -> Json<Overview> {
    let breakers = state.dispatcher.breakers();
    Json(Overview {
        circuits: breakers.snapshot(),
        open_circuits: breakers.open_count(),
        cache: state.dispatcher.cache().stats(),
        hub: state.hub.stats(),
        rate_limit_degraded: state.limiter.is_degraded(),
        rate_windows: state.limiter.window_count(),
    })
}

pub async fn get_circuits(State(state): State<AppState>) -> Json<Vec<CircuitSnapshot>> {
    Json(state.dispatcher.breakers().snapshot())
}

pub async fn reset_circuits(State(state): State<AppState>) -> Json<ResetResult> {
    let reset = state.dispatcher.breakers().reset_all();
    tracing::info!(count = reset, "All circuits reset by operator");
    Json(ResetResult { reset })
}

pub async fn reset_circuit(State(state): State<AppState>, Path(backend): Path<String>) -> Response {
    if state.dispatcher.breakers().reset(&backend) {
        tracing::info!(backend = %backend, "Circuit reset by operator");
        Json(ResetResult { reset: 1 }).into_response()
    } else {
        error_response(StatusCode::NOT_FOUND, "not_found", "no circuit for that backend")
    }
}

pub async fn get_cache(State(state): State<AppState>) -> Json<CacheStats> {
    Json(state.dispatcher.cache().stats())
}

pub async fn flush_cache(State(state): State<AppState>) -> Json<serde_json::Value> {
    let removed = state.dispatcher.cache().flush().await;
    tracing::info!(removed, "Cache flushed by operator");
    Json(serde_json::json!({ "removed": removed }))
}

pub async fn invalidate_tag(State(state): State<AppState>, Path(tag): Path<String>) -> Json<serde_json::Value> {
    let removed = state.dispatcher.cache().invalidate_tag(&tag).await;
    tracing::info!(tag = %tag, removed, "Cache tag invalidated by operator");
    Json(serde_json::json!({ "tag": tag, "removed": removed }))
}

pub async fn reset_cache_stats(State(state): State<AppState>) -> StatusCode {
    state.dispatcher.cache().reset_stats();
    StatusCode::NO_CONTENT
}
