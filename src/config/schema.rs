//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener configuration (bind address, TLS).
    pub listener: ListenerConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Default circuit breaker settings, applied to every backend without an override.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Named backend services.
    pub backends: Vec<BackendConfig>,

    /// Route definitions mapping inbound paths to backends.
    pub routes: Vec<RouteConfig>,

    /// Rate limiting configuration.
    pub rate_limit: RateLimitConfig,

    /// Cache-aside settings.
    pub cache: CacheConfig,

    /// Shared key-value store used by the cache, the limiter and the backbone.
    pub store: StoreConfig,

    /// Realtime fan-out settings.
    pub realtime: RealtimeConfig,

    /// Caller identity resolution.
    pub identity: IdentityConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    pub admin: AdminConfig,

    pub security: SecurityConfig,
}

impl GatewayConfig {
    /// Find a backend definition by name.
    pub fn backend(&self, name: &str) -> Option<&BackendConfig> {
        self.backends.iter().find(|b| b.name == name)
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Optional TLS configuration.
    pub tls: Option<TlsConfig>,

    /// Maximum concurrent in-flight requests (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            tls: None,
            max_connections: 10_000,
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Backend connection establishment timeout in milliseconds.
    pub connect_ms: u64,

    /// Default deadline for a single dispatch (all attempts) in milliseconds.
    pub dispatch_ms: u64,

    /// Outer request timeout enforced on the whole inbound request, in seconds.
    pub request_secs: u64,

    /// Time allowed for in-flight work to drain on shutdown, in seconds.
    pub shutdown_grace_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: 2_000,
            dispatch_ms: 10_000,
            request_secs: 30,
            shutdown_grace_secs: 10,
        }
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures within the monitoring period that open the circuit.
    pub failure_threshold: u32,

    /// Consecutive half-open successes that close the circuit.
    pub success_threshold: u32,

    /// How long an open circuit rejects calls before allowing a trial, in milliseconds.
    pub open_timeout_ms: u64,

    /// Sliding window for counting failures, in milliseconds.
    pub monitoring_period_ms: u64,
}

impl CircuitBreakerConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn monitoring_period(&self) -> Duration {
        Duration::from_millis(self.monitoring_period_ms)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout_ms: 60_000,
            monitoring_period_ms: 60_000,
        }
    }
}

/// A named backend service.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Unique backend identifier, used by routes and as the circuit key.
    pub name: String,

    /// Base URL (e.g., "http://users.internal:3000").
    pub base_url: String,

    /// Dispatch deadline override in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Circuit breaker override for this backend.
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

/// Route configuration mapping inbound requests to a backend.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    /// Route identifier for logging/metrics.
    pub name: String,

    /// Path prefix to match (e.g., "/api/users").
    pub path_prefix: String,

    /// Restrict to these methods (empty = any).
    #[serde(default)]
    pub methods: Vec<String>,

    /// Backend name to forward to.
    pub backend: String,

    /// Remove the matched prefix before forwarding.
    #[serde(default)]
    pub strip_prefix: bool,

    /// Rate limit class; writes default to "write", reads to "default".
    #[serde(default)]
    pub rate_class: Option<String>,

    /// Cache GET responses for this many seconds.
    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,

    /// Tags attached to cached responses.
    #[serde(default)]
    pub cache_tags: Vec<String>,

    /// Tags invalidated after a successful write.
    #[serde(default)]
    pub invalidate_tags: Vec<String>,

    /// Fan-out topic notified after a successful write.
    #[serde(default)]
    pub notify_topic: Option<String>,

    /// Event name used for the fan-out notification.
    #[serde(default)]
    pub notify_event: Option<String>,

    /// Dispatch deadline override in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Route priority (higher = checked first).
    #[serde(default)]
    pub priority: u32,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    pub enabled: bool,

    /// Limits per route class.
    pub classes: BTreeMap<String, RateClassConfig>,

    /// How often stale windows are evicted, in seconds.
    pub sweep_interval_secs: u64,

    /// Keep counters in the shared store when one is configured.
    pub use_store: bool,
}

impl RateLimitConfig {
    /// Largest window across all classes; windows older than this are stale.
    pub fn max_window(&self) -> Duration {
        self.classes
            .values()
            .map(|c| c.window())
            .max()
            .unwrap_or(Duration::from_secs(60))
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let mut classes = BTreeMap::new();
        classes.insert("default".to_string(), RateClassConfig { limit: 300, window_secs: 60 });
        classes.insert("write".to_string(), RateClassConfig { limit: 60, window_secs: 60 });
        classes.insert("expensive".to_string(), RateClassConfig { limit: 10, window_secs: 60 });
        Self {
            enabled: true,
            classes,
            sweep_interval_secs: 60,
            use_store: true,
        }
    }
}

/// Limit for one route class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct RateClassConfig {
    /// Requests allowed per window.
    pub limit: u64,

    /// Window length in seconds.
    pub window_secs: u64,
}

impl RateClassConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Cache-aside settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,

    /// TTL used when a cacheable route omits one, in seconds.
    pub default_ttl_secs: u64,

    /// Responses larger than this are never cached.
    pub max_entry_bytes: usize,

    /// How often the in-memory backend drops expired entries, in seconds.
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl_secs: 60,
            max_entry_bytes: 512 * 1024,
            sweep_interval_secs: 30,
        }
    }
}

/// Shared store settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Redis URL; when absent the gateway runs on in-process state only.
    pub redis_url: Option<String>,

    /// Upper bound on a single store round-trip, in milliseconds.
    pub op_timeout_ms: u64,

    /// Prefix applied to every key written by this gateway.
    pub key_prefix: String,

    /// After a store failure, skip the store for this long, in milliseconds.
    pub retry_after_ms: u64,
}

impl StoreConfig {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    pub fn retry_after(&self) -> Duration {
        Duration::from_millis(self.retry_after_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            op_timeout_ms: 250,
            key_prefix: "gw".to_string(),
            retry_after_ms: 5_000,
        }
    }
}

/// Realtime fan-out settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub enabled: bool,

    /// Pub/sub channel shared by every gateway instance.
    pub channel: String,

    /// Per-connection outbound queue length; messages beyond it are dropped.
    pub client_buffer: usize,

    /// Connections silent for longer than this are disconnected, in seconds.
    pub idle_timeout_secs: u64,

    /// How often idle connections are swept, in seconds.
    pub sweep_interval_secs: u64,

    /// Server ping interval, in seconds.
    pub ping_interval_secs: u64,

    /// Maximum topics a single connection may hold.
    pub max_topics_per_connection: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            channel: "gateway:fanout".to_string(),
            client_buffer: 256,
            idle_timeout_secs: 120,
            sweep_interval_secs: 30,
            ping_interval_secs: 30,
            max_topics_per_connection: 100,
        }
    }
}

/// How callers are identified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IdentityMode {
    /// Trust identity headers set by an upstream authenticator.
    #[default]
    Headers,
    /// Resolve bearer tokens against a static table.
    Tokens,
}

/// Caller identity resolution.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub mode: IdentityMode,

    /// Header carrying the user id in `headers` mode.
    pub user_header: String,

    /// Header carrying the tenant id in `headers` mode.
    pub tenant_header: String,

    /// Token table used in `tokens` mode.
    pub tokens: Vec<TokenConfig>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            mode: IdentityMode::Headers,
            user_header: "x-user-id".to_string(),
            tenant_header: "x-tenant-id".to_string(),
            tokens: Vec::new(),
        }
    }
}

/// A static bearer token.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenConfig {
    pub token: String,
    pub user_id: String,
    pub tenant_id: String,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin surface configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable admin endpoints.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: String::new(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}

/// Security hardening configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Maximum inbound body size in bytes.
    pub max_body_size: usize,

    /// Maximum backend response body buffered by the dispatcher, in bytes.
    pub max_response_size: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_body_size: 2 * 1024 * 1024, // 2MB
            max_response_size: 8 * 1024 * 1024,
        }
    }
}
