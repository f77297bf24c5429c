//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (routes reference existing backends and rate classes)
//! - Validate value ranges (thresholds > 0, windows > 0, URLs parse)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;
use thiserror::Error;
use url::Url;

use crate::config::schema::{CircuitBreakerConfig, GatewayConfig, IdentityMode};

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new("listener.bind_address", "not a socket address"));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be > 0"));
    }
    if config.timeouts.dispatch_ms == 0 {
        errors.push(ValidationError::new("timeouts.dispatch_ms", "must be > 0"));
    }

    check_breaker("circuit_breaker", &config.circuit_breaker, &mut errors);

    let mut names = HashSet::new();
    for (i, backend) in config.backends.iter().enumerate() {
        let field = format!("backends[{}]", i);
        if !names.insert(backend.name.as_str()) {
            errors.push(ValidationError::new(
                format!("{}.name", field),
                format!("duplicate backend '{}'", backend.name),
            ));
        }
        match Url::parse(&backend.base_url) {
            Ok(url) if url.scheme() == "http" => {}
            Ok(url) => errors.push(ValidationError::new(
                format!("{}.base_url", field),
                format!("unsupported scheme '{}'", url.scheme()),
            )),
            Err(e) => errors.push(ValidationError::new(format!("{}.base_url", field), e.to_string())),
        }
        if backend.timeout_ms == Some(0) {
            errors.push(ValidationError::new(format!("{}.timeout_ms", field), "must be > 0"));
        }
        if let Some(cb) = &backend.circuit_breaker {
            check_breaker(&format!("{}.circuit_breaker", field), cb, &mut errors);
        }
    }

    for (i, route) in config.routes.iter().enumerate() {
        let field = format!("routes[{}]", i);
        if !route.path_prefix.starts_with('/') {
            errors.push(ValidationError::new(format!("{}.path_prefix", field), "must start with '/'"));
        }
        if !names.contains(route.backend.as_str()) {
            errors.push(ValidationError::new(
                format!("{}.backend", field),
                format!("unknown backend '{}'", route.backend),
            ));
        }
        if let Some(class) = &route.rate_class {
            if !config.rate_limit.classes.contains_key(class) {
                errors.push(ValidationError::new(
                    format!("{}.rate_class", field),
                    format!("unknown rate class '{}'", class),
                ));
            }
        }
        if route.cache_ttl_secs == Some(0) {
            errors.push(ValidationError::new(format!("{}.cache_ttl_secs", field), "must be > 0"));
        }
        for method in &route.methods {
            if method.parse::<axum::http::Method>().is_err() {
                errors.push(ValidationError::new(
                    format!("{}.methods", field),
                    format!("invalid method '{}'", method),
                ));
            }
        }
    }

    for (name, class) in &config.rate_limit.classes {
        if class.limit == 0 || class.window_secs == 0 {
            errors.push(ValidationError::new(
                format!("rate_limit.classes.{}", name),
                "limit and window_secs must be > 0",
            ));
        }
    }

    if config.realtime.client_buffer == 0 {
        errors.push(ValidationError::new("realtime.client_buffer", "must be > 0"));
    }
    if config.realtime.idle_timeout_secs == 0 {
        errors.push(ValidationError::new("realtime.idle_timeout_secs", "must be > 0"));
    }

    if let Some(url) = &config.store.redis_url {
        if Url::parse(url).is_err() {
            errors.push(ValidationError::new("store.redis_url", "not a valid URL"));
        }
    }

    if config.identity.mode == IdentityMode::Tokens && config.identity.tokens.is_empty() {
        errors.push(ValidationError::new("identity.tokens", "tokens mode requires at least one token"));
    }

    if config.admin.enabled {
        if config.admin.api_key.trim().is_empty() {
            errors.push(ValidationError::new("admin.api_key", "must be set when admin is enabled"));
        }
        if config.admin.bind_address.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::new("admin.bind_address", "not a socket address"));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_breaker(field: &str, cb: &CircuitBreakerConfig, errors: &mut Vec<ValidationError>) {
    if cb.failure_threshold == 0 {
        errors.push(ValidationError::new(format!("{}.failure_threshold", field), "must be > 0"));
    }
    if cb.success_threshold == 0 {
        errors.push(ValidationError::new(format!("{}.success_threshold", field), "must be > 0"));
    }
    if cb.open_timeout_ms == 0 || cb.monitoring_period_ms == 0 {
        errors.push(ValidationError::new(field, "open_timeout_ms and monitoring_period_ms must be > 0"));
    }
}
