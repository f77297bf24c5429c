//! Retry policy for dispatches.
//!
//! # Rules
//! - At most one retry per dispatch; nothing is shared across dispatches
//! - Only GET is retried
//! - Only connection-level failures are retried, never HTTP error statuses or timeouts
//! - Never retry into a circuit that the first attempt just opened

use axum::http::Method;

use crate::resilience::circuit_breaker::CircuitState;

/// Retries allowed on top of the first attempt.
pub const MAX_RETRIES: u32 = 1;

/// Decide whether a failed attempt may be repeated.
///
/// `retries_done` counts retries already performed for this dispatch.
pub fn is_retryable(
    method: &Method,
    connection_level: bool,
    retries_done: u32,
    circuit: CircuitState,
) -> bool {
    retries_done < MAX_RETRIES
        && *method == Method::GET
        && connection_level
        && circuit != CircuitState::Open
}
