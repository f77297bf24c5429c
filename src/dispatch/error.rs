use std::time::Duration;

use axum::http::StatusCode;
use thiserror::Error;

use crate::dispatch::transport::TransportError;

/// Why a dispatch produced no backend response.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("circuit open for backend '{backend}'")]
    CircuitOpen { backend: String, retry_after: Duration },

    #[error("backend '{backend}' returned {status}")]
    Backend {
        backend: String,
        status: StatusCode,
        /// Error code reported by the backend body, when it gave one.
        code: Option<String>,
    },

    #[error("backend '{backend}' timed out after {timeout:?}")]
    Timeout { backend: String, timeout: Duration },

    #[error("calling backend '{backend}' failed: {source}")]
    Transport {
        backend: String,
        #[source]
        source: TransportError,
    },

    #[error("unknown backend '{0}'")]
    UnknownBackend(String),

    #[error("invalid dispatch options: {0}")]
    InvalidOptions(String),
}

impl DispatchError {
    /// Stable, client-visible error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::CircuitOpen { .. } => "circuit_open",
            DispatchError::Backend { .. } => "backend_error",
            DispatchError::Timeout { .. } => "timeout",
            DispatchError::Transport { .. } => "backend_unavailable",
            DispatchError::UnknownBackend(_) => "bad_gateway",
            DispatchError::InvalidOptions(_) => "internal_error",
        }
    }

    /// 4xx from a backend passes through; its 5xx becomes 502.
    pub fn status(&self) -> StatusCode {
        match self {
            DispatchError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            DispatchError::Backend { status, .. } if status.is_client_error() => *status,
            DispatchError::Backend { .. } => StatusCode::BAD_GATEWAY,
            DispatchError::Transport { .. } | DispatchError::UnknownBackend(_) => StatusCode::BAD_GATEWAY,
            DispatchError::InvalidOptions(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            DispatchError::CircuitOpen { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Message safe to show clients: no addresses, no backend internals.
    pub fn safe_message(&self) -> String {
        match self {
            DispatchError::CircuitOpen { .. } => "service temporarily unavailable".to_string(),
            DispatchError::Backend { status, code, .. } => match code {
                Some(code) => format!("upstream request failed ({})", code),
                None => format!("upstream request failed with status {}", status.as_u16()),
            },
            DispatchError::Timeout { .. } => "upstream request timed out".to_string(),
            DispatchError::Transport { .. } | DispatchError::UnknownBackend(_) => {
                "upstream service unreachable".to_string()
            }
            DispatchError::InvalidOptions(_) => "internal error".to_string(),
        }
    }
}
