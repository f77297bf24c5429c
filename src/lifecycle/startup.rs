//! Startup orchestration.
//!
//! # Responsibilities
//! - Build every shared component from configuration, in dependency order
//! - Start background tasks (sweeps, backbone listener, admin listener)
//! - Bind the public listener and serve until shutdown
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - A missing or unreachable store is not a startup error; the gateway
//!   runs on in-process state until the store answers
//! - Listeners start last (traffic only when ready)

use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::admin::setup_admin_router;
use crate::cache::{CacheBackend, CacheStore, MemoryBackend, RedisBackend};
use crate::config::loader::ConfigError;
use crate::config::validation::validate_config;
use crate::config::GatewayConfig;
use crate::dispatch::{BackendRegistry, Dispatcher, HyperTransport};
use crate::http::{AppState, HttpServer};
use crate::lifecycle::shutdown::Shutdown;
use crate::lifecycle::signals::wait_for_signal;
use crate::net::tls::load_tls_config;
use crate::realtime::{Backbone, FanoutHub, RedisBackbone};
use crate::resilience::CircuitBreakerRegistry;
use crate::routing::RouteTable;
use crate::security::identity::provider_from_config;
use crate::security::rate_limit::RateLimiter;
use crate::store::{RedisStore, StoreError};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS setup failed: {0}")]
    Tls(#[source] std::io::Error),

    #[error("server error: {0}")]
    Server(#[source] std::io::Error),
}

/// Every long-lived component of a running gateway.
pub struct Gateway {
    state: AppState,
    memory_cache: Option<Arc<MemoryBackend>>,
    shutdown: Arc<Shutdown>,
}

impl Gateway {
    /// Validate `config` and build the component graph. Nothing is bound yet.
    pub fn build(config: GatewayConfig) -> Result<Self, StartupError> {
        validate_config(&config).map_err(ConfigError::Validation)?;
        let config = Arc::new(config);
        let retry_after = config.store.retry_after();

        let store = match &config.store.redis_url {
            Some(url) => {
                let store = RedisStore::open(url, &config.store)?;
                tracing::info!(prefix = %config.store.key_prefix, "Shared store configured");
                Some(store)
            }
            None => {
                tracing::info!("No shared store configured, using in-process state");
                None
            }
        };

        let (cache_backend, memory_cache) = match &store {
            Some(store) => {
                let backend: Arc<dyn CacheBackend> = Arc::new(RedisBackend::new(store.clone()));
                (backend, None)
            }
            None => {
                let memory = Arc::new(MemoryBackend::new());
                (memory.clone() as Arc<dyn CacheBackend>, Some(memory))
            }
        };
        let cache = Arc::new(CacheStore::new(cache_backend, &config.cache, retry_after));

        let mut breakers = CircuitBreakerRegistry::new(config.circuit_breaker.clone());
        for backend in &config.backends {
            if let Some(overrides) = &backend.circuit_breaker {
                breakers = breakers.with_override(backend.name.clone(), overrides.clone());
            }
        }
        let breakers = Arc::new(breakers);

        let limiter_store = store.clone().filter(|_| config.rate_limit.use_store);
        let limiter = Arc::new(RateLimiter::new(&config.rate_limit, limiter_store, retry_after));

        let backbone: Option<Arc<dyn Backbone>> = match &store {
            Some(store) if config.realtime.enabled => Some(Arc::new(RedisBackbone::new(
                store.clone(),
                config.realtime.channel.clone(),
            ))),
            _ => None,
        };
        let hub = Arc::new(FanoutHub::new(&config.realtime, backbone, retry_after));

        let transport = Arc::new(HyperTransport::new(
            Duration::from_millis(config.timeouts.connect_ms),
            config.security.max_response_size,
        ));
        let dispatcher = Dispatcher::new(
            BackendRegistry::from_config(&config.backends),
            transport,
            breakers,
            cache,
            Duration::from_millis(config.timeouts.dispatch_ms),
        )
        .with_hub(hub.clone());

        let state = AppState {
            dispatcher: Arc::new(dispatcher),
            routes: Arc::new(RouteTable::new(&config.routes)),
            hub,
            identity: provider_from_config(&config.identity),
            limiter,
            config,
        };

        tracing::info!(
            backends = state.config.backends.len(),
            routes = state.routes.len(),
            hub = %state.hub.instance(),
            "Gateway initialized"
        );

        Ok(Self {
            state,
            memory_cache,
            shutdown: Arc::new(Shutdown::new()),
        })
    }

    /// Load, validate and build from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, StartupError> {
        Self::build(crate::config::loader::load_config(path)?)
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.state.config
    }

    pub fn shutdown_handle(&self) -> Arc<Shutdown> {
        self.shutdown.clone()
    }

    /// Bind the configured listener and serve until SIGINT/SIGTERM.
    pub async fn run(self) -> Result<(), StartupError> {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            shutdown.trigger();
        });

        let bind = self.state.config.listener.bind_address.clone();
        match self.state.config.listener.tls.clone() {
            Some(tls) => {
                let addr: SocketAddr = bind
                    .parse()
                    .map_err(|_| StartupError::InvalidAddress(bind.clone()))?;
                let tls = load_tls_config(Path::new(&tls.cert_path), Path::new(&tls.key_path))
                    .await
                    .map_err(StartupError::Tls)?;
                let background = self.spawn_background().await?;
                let server = HttpServer::new(self.state.clone());
                let result = server.run_tls(addr, tls, self.shutdown.subscribe()).await;
                self.finish(background).await;
                result.map_err(StartupError::Server)
            }
            None => {
                let listener = TcpListener::bind(&bind)
                    .await
                    .map_err(|source| StartupError::Bind { addr: bind.clone(), source })?;
                self.serve(listener).await
            }
        }
    }

    /// Serve on an already-bound listener until the shutdown handle fires.
    pub async fn serve(self, listener: TcpListener) -> Result<(), StartupError> {
        let background = self.spawn_background().await?;
        let server = HttpServer::new(self.state.clone());
        let result = server.run(listener, self.shutdown.subscribe()).await;
        self.finish(background).await;
        result.map_err(StartupError::Server)
    }

    async fn spawn_background(&self) -> Result<Vec<JoinHandle<()>>, StartupError> {
        let config = &self.state.config;
        let mut tasks = Vec::new();

        if config.rate_limit.enabled {
            let limiter = self.state.limiter.clone();
            tasks.push(self.spawn_sweep(
                "rate_windows",
                Duration::from_secs(config.rate_limit.sweep_interval_secs.max(1)),
                move || limiter.sweep(),
            ));
        }

        if let Some(memory) = self.memory_cache.clone() {
            tasks.push(self.spawn_sweep(
                "cache_entries",
                Duration::from_secs(config.cache.sweep_interval_secs.max(1)),
                move || memory.sweep_expired(),
            ));
        }

        if config.realtime.enabled {
            let hub = self.state.hub.clone();
            tasks.push(self.spawn_sweep(
                "idle_connections",
                Duration::from_secs(config.realtime.sweep_interval_secs.max(1)),
                move || hub.sweep_idle(),
            ));
            tasks.push(tokio::spawn(
                self.state.hub.clone().run_backbone_listener(self.shutdown.subscribe()),
            ));
        }

        if config.admin.enabled {
            let addr = config.admin.bind_address.clone();
            let listener = TcpListener::bind(&addr)
                .await
                .map_err(|source| StartupError::Bind { addr: addr.clone(), source })?;
            let router = setup_admin_router(self.state.clone());
            let mut shutdown = self.shutdown.subscribe();
            tracing::info!(address = %addr, "Admin server starting");
            tasks.push(tokio::spawn(async move {
                let served = axum::serve(listener, router)
                    .with_graceful_shutdown(async move {
                        let _ = shutdown.recv().await;
                    })
                    .await;
                if let Err(e) = served {
                    tracing::error!(error = %e, "Admin server failed");
                }
            }));
        }

        Ok(tasks)
    }

    fn spawn_sweep<F>(&self, name: &'static str, every: Duration, sweep: F) -> JoinHandle<()>
    where
        F: Fn() -> usize + Send + 'static,
    {
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        let removed = sweep();
                        if removed > 0 {
                            tracing::debug!(sweep = name, removed, "Sweep completed");
                        }
                    }
                }
            }
        })
    }

    /// Stop background work and close realtime clients.
    async fn finish(&self, background: Vec<JoinHandle<()>>) {
        self.shutdown.trigger();
        let closed = self.state.hub.close_all();
        tracing::info!(connections = closed, "Realtime connections closed");

        let grace = Duration::from_secs(self.state.config.timeouts.shutdown_grace_secs);
        if with_grace(grace, futures_util::future::join_all(background)).await.is_none() {
            tracing::warn!("Background tasks did not stop within the grace period");
        }
    }
}

async fn with_grace<F: Future>(grace: Duration, fut: F) -> Option<F::Output> {
    tokio::time::timeout(grace, fut).await.ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, CircuitBreakerConfig};

    #[tokio::test]
    async fn test_build_applies_breaker_overrides() {
        let mut config = GatewayConfig::default();
        config.backends.push(BackendConfig {
            name: "payments".into(),
            base_url: "http://127.0.0.1:1".into(),
            timeout_ms: None,
            circuit_breaker: Some(CircuitBreakerConfig {
                failure_threshold: 2,
                ..CircuitBreakerConfig::default()
            }),
        });

        let gateway = Gateway::build(config).unwrap();
        let breaker = gateway.state().dispatcher.breakers().get("payments");
        assert_eq!(breaker.config().failure_threshold, 2);
        assert_eq!(
            gateway.state().dispatcher.breakers().get("other").config().failure_threshold,
            5
        );
        assert!(gateway.memory_cache.is_some());
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let mut config = GatewayConfig::default();
        config.timeouts.dispatch_ms = 0;
        assert!(matches!(Gateway::build(config), Err(StartupError::Config(_))));
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let gateway = Gateway::build(GatewayConfig::default()).unwrap();
        let shutdown = gateway.shutdown_handle();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let server = tokio::spawn(gateway.serve(listener));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.trigger();

        let result = tokio::time::timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
        assert!(result.is_ok());
    }
}
