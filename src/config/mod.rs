//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → GatewayConfig (validated, immutable)
//!     → handed to lifecycle::startup, which builds every subsystem from it
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a restart
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use schema::{
    AdminConfig, BackendConfig, CacheConfig, CircuitBreakerConfig, GatewayConfig,
    IdentityConfig, IdentityMode, ListenerConfig, LogFormat, ObservabilityConfig,
    RateClassConfig, RateLimitConfig, RealtimeConfig, RouteConfig, SecurityConfig,
    StoreConfig, TimeoutConfig, TlsConfig, TokenConfig,
};
