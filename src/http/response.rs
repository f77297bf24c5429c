//! Response handling and transformation.
//!
//! # Responsibilities
//! - Render dispatch results for the client
//! - Map gateway errors to status codes with a safe JSON body
//!
//! # Design Decisions
//! - Error bodies are `{ "error": kind, "message": text }` and nothing else
//! - Backend timeouts result in 504 Gateway Timeout

use std::time::Duration;

use axum::{
    body::Body,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::dispatch::{DispatchError, DispatchResponse};
use crate::security::rate_limit::RateLimited;

pub const X_CACHE: &str = "x-cache";
pub const X_CIRCUIT_STATE: &str = "x-circuit-state";

pub fn error_response(status: StatusCode, kind: &str, message: &str) -> Response {
    (status, Json(json!({ "error": kind, "message": message }))).into_response()
}

fn retry_after_secs(retry_after: Duration) -> HeaderValue {
    // round up so clients never retry early
    let secs = retry_after.as_millis().div_ceil(1000).max(1) as u64;
    HeaderValue::from(secs)
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let mut response = error_response(self.status(), self.kind(), &self.safe_message());
        if let Some(retry_after) = self.retry_after() {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, retry_after_secs(retry_after));
        }
        response
    }
}

impl IntoResponse for RateLimited {
    fn into_response(self) -> Response {
        let mut response = error_response(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limited",
            "rate limit exceeded, retry later",
        );
        let headers = response.headers_mut();
        headers.insert(header::RETRY_AFTER, retry_after_secs(self.retry_after));
        headers.insert("x-ratelimit-limit", HeaderValue::from(self.limit));
        headers.insert("x-ratelimit-remaining", HeaderValue::from(0u64));
        response
    }
}

impl IntoResponse for DispatchResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        let headers = response.headers_mut();
        if let Some(content_type) = self.content_type.and_then(|ct| HeaderValue::from_str(&ct).ok()) {
            headers.insert(header::CONTENT_TYPE, content_type);
        }
        headers.insert(
            X_CACHE,
            HeaderValue::from_static(if self.cached { "HIT" } else { "MISS" }),
        );
        if let Ok(state) = HeaderValue::from_str(&self.circuit_state.to_string()) {
            headers.insert(X_CIRCUIT_STATE, state);
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::CircuitState;
    use axum::body::{to_bytes, Bytes};

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), 1024).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_circuit_open_has_retry_after() {
        let response = DispatchError::CircuitOpen {
            backend: "users".into(),
            retry_after: Duration::from_millis(1500),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], "2");
        let body = body_json(response).await;
        assert_eq!(body, json!({"error": "circuit_open", "message": "service temporarily unavailable"}));
    }

    #[tokio::test]
    async fn test_rate_limited_response() {
        let response = RateLimited {
            class: "write".into(),
            limit: 60,
            retry_after: Duration::from_secs(12),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "12");
        assert_eq!(response.headers()["x-ratelimit-limit"], "60");
        assert_eq!(body_json(response).await["error"], "rate_limited");
    }

    #[tokio::test]
    async fn test_dispatch_response_headers() {
        let response = DispatchResponse {
            status: StatusCode::OK,
            content_type: Some("application/json".into()),
            body: Bytes::from_static(b"{}"),
            cached: true,
            circuit_state: CircuitState::HalfOpen,
        }
        .into_response();
        assert_eq!(response.headers()[X_CACHE], "HIT");
        assert_eq!(response.headers()[X_CIRCUIT_STATE], "half_open");
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
    }
}
