//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gateway_requests_total` (counter): requests by method, status, backend
//! - `gateway_request_duration_seconds` (histogram): end-to-end latency
//! - `gateway_dispatch_total` (counter): backend calls by backend, outcome
//! - `gateway_cache_total` (counter): cache lookups by result
//! - `gateway_circuit_transitions_total` (counter): breaker state changes
//! - `gateway_rate_limited_total` (counter): rejections by class
//! - `gateway_fanout_delivered_total` / `gateway_fanout_dropped_total` (counters)
//! - `gateway_ws_connections` (gauge): open realtime connections

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram, Label};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::resilience::CircuitState;

/// Start the Prometheus scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Prometheus metrics server started"),
        Err(e) => tracing::error!(error = %e, "Failed to start Prometheus exporter"),
    }
}

pub fn record_request(method: &str, status: u16, backend: &str, start: Instant) {
    let labels = vec![
        Label::new("method", method.to_string()),
        Label::new("status", status.to_string()),
        Label::new("backend", backend.to_string()),
    ];
    counter!("gateway_requests_total", labels.clone()).increment(1);
    histogram!("gateway_request_duration_seconds", labels).record(start.elapsed().as_secs_f64());
}

pub fn record_dispatch(backend: &str, outcome: &'static str) {
    counter!("gateway_dispatch_total", "backend" => backend.to_string(), "outcome" => outcome)
        .increment(1);
}

pub fn record_cache(result: &'static str) {
    counter!("gateway_cache_total", "result" => result).increment(1);
}

pub fn record_circuit_transition(backend: &str, to: CircuitState) {
    counter!(
        "gateway_circuit_transitions_total",
        "backend" => backend.to_string(),
        "to" => to.to_string()
    )
    .increment(1);
}

pub fn record_rate_limited(class: &str) {
    counter!("gateway_rate_limited_total", "class" => class.to_string()).increment(1);
}

pub fn record_fanout_delivered(count: usize) {
    counter!("gateway_fanout_delivered_total").increment(count as u64);
}

pub fn record_fanout_dropped(count: usize) {
    counter!("gateway_fanout_dropped_total").increment(count as u64);
}

pub fn set_ws_connections(count: usize) {
    gauge!("gateway_ws_connections").set(count as f64);
}
