//! Cache-aside response store.
//!
//! # Data Flow
//! ```text
//! dispatcher ─→ store.rs (CacheStore::get_or_set)
//!                 ├─ hit  → decoded value, no backend call
//!                 └─ miss → fetcher → value written back with TTL + tags
//!                                │
//!                                ▼
//!                  backend.rs (CacheBackend trait)
//!                    ├─ MemoryBackend (single instance, tests)
//!                    └─ redis.rs (RedisBackend, shared across instances)
//! ```
//!
//! # Design Decisions
//! - The cache never fails a request: store errors degrade to misses
//! - Tag sets live as long as their longest-lived member
//! - Keys are derived from canonical JSON (see key.rs)

pub mod backend;
pub mod key;
pub mod redis;
pub mod store;

pub use backend::{CacheBackend, MemoryBackend};
pub use key::cache_key;
pub use self::redis::RedisBackend;
pub use store::{CacheStats, CacheStore, Cached};
