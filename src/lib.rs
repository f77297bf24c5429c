//! Multi-tenant API gateway: circuit-broken dispatch, cache-aside responses,
//! fixed-window rate limits and websocket fan-out over a shared backbone.

pub mod admin;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod realtime;
pub mod resilience;
pub mod routing;
pub mod security;
pub mod store;

pub use config::schema::GatewayConfig;
pub use http::HttpServer;
pub use lifecycle::{Gateway, Shutdown, StartupError};
