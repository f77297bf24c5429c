//! Caller identity.
//!
//! Token validation itself is out of scope for the gateway. Two simple
//! providers are built in: trusted headers set by an upstream auth proxy,
//! and a static bearer-token table.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::config::{IdentityConfig, IdentityMode};
use crate::http::response::error_response;

/// Authenticated caller. Attached to request extensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Identity {
    pub user_id: String,
    pub tenant_id: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            tenant_id: tenant_id.into(),
        }
    }

    /// Key used for per-caller accounting.
    pub fn key(&self) -> String {
        format!("{}/{}", self.tenant_id, self.user_id)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("missing credentials")]
    MissingCredentials,

    #[error("missing header '{0}'")]
    MissingHeader(String),

    #[error("invalid header '{0}'")]
    InvalidHeader(String),

    #[error("unknown token")]
    UnknownToken,
}

impl IntoResponse for IdentityError {
    fn into_response(self) -> Response {
        error_response(StatusCode::UNAUTHORIZED, "unauthorized", &self.to_string())
    }
}

/// Resolves the caller of a request.
///
/// `query_token` carries the `access_token` query parameter for WebSocket
/// handshakes, where browsers cannot set headers.
pub trait IdentityProvider: Send + Sync {
    fn identify(&self, headers: &HeaderMap, query_token: Option<&str>) -> Result<Identity, IdentityError>;
}

/// Build the provider selected by config.
pub fn provider_from_config(config: &IdentityConfig) -> Arc<dyn IdentityProvider> {
    match config.mode {
        IdentityMode::Headers => Arc::new(TrustedHeaders::new(&config.user_header, &config.tenant_header)),
        IdentityMode::Tokens => Arc::new(StaticTokens::new(
            config
                .tokens
                .iter()
                .map(|t| (t.token.clone(), Identity::new(&t.user_id, &t.tenant_id))),
        )),
    }
}

/// Trusts user and tenant headers injected upstream.
pub struct TrustedHeaders {
    user_header: String,
    tenant_header: String,
}

impl TrustedHeaders {
    pub fn new(user_header: &str, tenant_header: &str) -> Self {
        Self {
            user_header: user_header.to_ascii_lowercase(),
            tenant_header: tenant_header.to_ascii_lowercase(),
        }
    }

    fn read(&self, headers: &HeaderMap, name: &str) -> Result<String, IdentityError> {
        let value = headers
            .get(name)
            .ok_or_else(|| IdentityError::MissingHeader(name.to_string()))?
            .to_str()
            .map_err(|_| IdentityError::InvalidHeader(name.to_string()))?
            .trim();
        if value.is_empty() {
            return Err(IdentityError::InvalidHeader(name.to_string()));
        }
        Ok(value.to_string())
    }
}

impl IdentityProvider for TrustedHeaders {
    fn identify(&self, headers: &HeaderMap, _query_token: Option<&str>) -> Result<Identity, IdentityError> {
        Ok(Identity {
            user_id: self.read(headers, &self.user_header)?,
            tenant_id: self.read(headers, &self.tenant_header)?,
        })
    }
}

/// Fixed table of bearer tokens.
pub struct StaticTokens {
    tokens: HashMap<String, Identity>,
}

impl StaticTokens {
    pub fn new(tokens: impl IntoIterator<Item = (String, Identity)>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }
}

impl IdentityProvider for StaticTokens {
    fn identify(&self, headers: &HeaderMap, query_token: Option<&str>) -> Result<Identity, IdentityError> {
        let bearer = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        let token = bearer.or(query_token).ok_or(IdentityError::MissingCredentials)?;
        self.tokens
            .get(token.trim())
            .cloned()
            .ok_or(IdentityError::UnknownToken)
    }
}

/// Reject unidentified callers before any other work happens.
pub async fn identity_middleware(
    State(provider): State<Arc<dyn IdentityProvider>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    match provider.identify(req.headers(), None) {
        Ok(identity) => {
            tracing::debug!(user = %identity.user_id, tenant = %identity.tenant_id, "Caller identified");
            req.extensions_mut().insert(identity);
            next.run(req).await
        }
        Err(e) => {
            tracing::debug!(error = %e, "Rejecting unidentified request");
            e.into_response()
        }
    }
}
