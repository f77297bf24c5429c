//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → identity.rs (resolve user + tenant, reject unidentified callers)
//!     → [route resolution]
//!     → rate_limit.rs (fixed window per identity and route class)
//!     → Pass to dispatch
//! ```
//!
//! # Design Decisions
//! - Fail closed: no identity, no dispatch
//! - Identity headers sent to backends come from the resolved identity only

pub mod identity;
pub mod rate_limit;
