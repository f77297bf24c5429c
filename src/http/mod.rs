//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (Axum setup, layers, identity, route resolution, rate limit)
//!     → request.rs (request ID, forwardable headers)
//!     → [dispatcher calls the backend]
//!     → response.rs (status mapping, cache/circuit headers, error bodies)
//!     → Send to client
//!
//! /ws upgrade
//!     → websocket.rs (handshake identity, hub registration, socket loop)
//! ```

pub mod request;
pub mod response;
pub mod server;
pub mod websocket;

pub use request::X_REQUEST_ID;
pub use server::{build_router, AppState, HttpServer};
