//! Shared key-value store plumbing.
//!
//! # Data Flow
//! ```text
//! cache (entries, tag sets) ─┐
//! rate limiter (windows)  ───┼─→ redis.rs (RedisStore: one multiplexed connection,
//! realtime backbone       ───┘             bounded round-trips, key prefixing)
//!
//! Any failure → health.rs (StoreHealth) marks the store degraded once,
//!               callers fall back to their local behaviour until the cooldown ends
//! ```
//!
//! # Design Decisions
//! - The store is advisory: nothing in the gateway requires it for correctness
//! - A lost connection is dropped and re-established lazily on the next call
//! - Every round-trip is bounded by `store.op_timeout_ms`

pub mod health;
pub mod redis;

use thiserror::Error;

pub use self::health::StoreHealth;
pub use self::redis::RedisStore;

/// Error talking to the shared store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("store operation timed out")]
    Timeout,

    #[error("store unavailable")]
    Unavailable,
}
