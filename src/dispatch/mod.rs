//! Service dispatch engine.
//!
//! # Data Flow
//! ```text
//! DispatchRequest (backend, method, path, headers, body, options)
//!     → dispatcher.rs
//!         ├─ cacheable? → CacheStore::get_or_set(key, ttl, tags, fetch)
//!         └─ fetch:
//!              CircuitBreaker::execute(
//!                  Deadline::run(transport.rs send)     ← one retry for GET
//!              )                                           connection failures
//!     → on successful write: invalidate tags, notify subscribers
//!     → DispatchResponse { status, body, cached, circuit_state }
//! ```
//!
//! # Design Decisions
//! - One deadline per dispatch, shared by every attempt
//! - Any non-2xx status counts as a breaker failure
//! - Errors carry only a kind and a safe message to clients

pub mod dispatcher;
pub mod error;
pub mod request;
pub mod transport;

pub use dispatcher::{DispatchResponse, Dispatcher};
pub use error::DispatchError;
pub use request::{CachePolicy, DispatchOptions, DispatchRequest, Notify};
pub use transport::{
    BackendRegistry, BackendResponse, BackendTarget, BackendTransport, HyperTransport, OutboundRequest,
    TransportError,
};
