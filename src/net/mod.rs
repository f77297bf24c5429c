//! Network layer subsystem.
//!
//! Plain TCP listeners are bound by `lifecycle::startup`; this module only
//! holds what TLS termination needs.
//!
//! ```text
//! Incoming TCP connection
//!     → tls.rs (optional TLS handshake, via axum-server)
//!     → Hand off to HTTP layer
//! ```

pub mod tls;
