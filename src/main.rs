//! tenant-gateway
//!
//! Multi-tenant API gateway built with Tokio and Axum.
//!
//! # Architecture Overview
//!
//! ```text
//!                         ┌──────────────────────────────────────────────────────────┐
//!                         │                      TENANT GATEWAY                      │
//!                         │                                                          │
//!   Client request        │  ┌──────────┐   ┌───────────┐   ┌────────┐   ┌────────┐  │
//!   ──────────────────────┼─▶│ identity │──▶│  routing  │──▶│  rate  │──▶│dispatch│──┼──▶ Backend
//!                         │  └──────────┘   └───────────┘   │ limit  │   └───┬────┘  │
//!                         │                                 └────────┘       │       │
//!                         │            ┌─────────────┐  ┌──────────────┐     │       │
//!                         │            │ cache-aside │◀─┤   circuit    │◀────┘       │
//!                         │            │    store    │  │   breakers   │             │
//!                         │            └──────┬──────┘  └──────────────┘             │
//!                         │                   │ write notifications                  │
//!   WebSocket clients     │            ┌──────▼──────┐        ┌──────────────┐       │
//!   ◀─────────────────────┼────────────│  fan-out    │◀──────▶│ Redis pub/sub│       │
//!                         │            │    hub      │        │   backbone   │       │
//!                         │            └─────────────┘        └──────────────┘       │
//!                         └──────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;

use tenant_gateway::config::loader::load_or_default;
use tenant_gateway::lifecycle::Gateway;
use tenant_gateway::observability::{logging::init_logging, metrics::init_metrics};

#[derive(Parser)]
#[command(name = "tenant-gateway", version, about = "Multi-tenant API gateway")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "GATEWAY_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_or_default(args.config.as_deref())?;

    init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "tenant-gateway starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        backends = config.backends.len(),
        routes = config.routes.len(),
        store = config.store.redis_url.is_some(),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    Gateway::build(config)?.run().await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
