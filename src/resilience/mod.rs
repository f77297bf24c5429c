//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Dispatch to backend:
//!     → circuit_breaker.rs (fail fast if open, record outcome)
//!     → timeouts.rs (deadline shared by every attempt of the dispatch)
//!     → On connection failure: retries.rs (one retry, GET only, circuit still closed)
//!
//! Backbone reconnects:
//!     → backoff.rs (exponential delay with jitter)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every backend call has a deadline
//! - Retries never amplify load on a failing backend
//! - Circuit breaker prevents cascading failures

pub mod backoff;
pub mod circuit_breaker;
pub mod retries;
pub mod timeouts;

pub use circuit_breaker::{
    CallError, CircuitBreaker, CircuitBreakerRegistry, CircuitOpenError, CircuitSnapshot,
    CircuitState,
};
