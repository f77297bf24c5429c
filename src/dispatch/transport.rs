//! Backend call interface.
//!
//! Maps backend names to base URLs and performs a single HTTP exchange.
//! Nothing here retries or enforces the dispatch deadline; dropping the
//! returned future aborts the call.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Method, Request, StatusCode};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use thiserror::Error;

use crate::config::BackendConfig;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("response body exceeds {0} bytes")]
    BodyTooLarge(usize),
}

impl TransportError {
    /// True when no HTTP exchange happened (refused, reset before response, DNS).
    pub fn is_connect(&self) -> bool {
        matches!(self, TransportError::Connect(_))
    }
}

/// A fully resolved outbound request.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub url: String,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[async_trait]
pub trait BackendTransport: Send + Sync {
    async fn send(&self, request: OutboundRequest) -> Result<BackendResponse, TransportError>;
}

/// hyper client transport.
#[derive(Clone)]
pub struct HyperTransport {
    client: Client<HttpConnector, Body>,
    max_response_size: usize,
}

impl HyperTransport {
    pub fn new(connect_timeout: Duration, max_response_size: usize) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(connect_timeout));
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .build(connector);
        Self {
            client,
            max_response_size,
        }
    }
}

#[async_trait]
impl BackendTransport for HyperTransport {
    async fn send(&self, request: OutboundRequest) -> Result<BackendResponse, TransportError> {
        let mut builder = Request::builder().method(request.method).uri(&request.url);
        if let Some(headers) = builder.headers_mut() {
            headers.extend(request.headers);
        }
        let req = builder
            .body(Body::from(request.body))
            .map_err(|e| TransportError::Invalid(e.to_string()))?;

        let response = self.client.request(req).await.map_err(|e| {
            if e.is_connect() {
                TransportError::Connect(e.to_string())
            } else {
                TransportError::Request(e.to_string())
            }
        })?;

        let (parts, body) = response.into_parts();
        let body = axum::body::to_bytes(Body::new(body), self.max_response_size)
            .await
            .map_err(|_| TransportError::BodyTooLarge(self.max_response_size))?;

        Ok(BackendResponse {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    }
}

/// Where a named backend lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendTarget {
    pub name: String,
    pub base_url: String,
    pub timeout: Option<Duration>,
}

impl BackendTarget {
    pub fn url_for(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

/// Name → base URL table.
#[derive(Debug, Clone, Default)]
pub struct BackendRegistry {
    targets: HashMap<String, BackendTarget>,
}

impl BackendRegistry {
    pub fn from_config(backends: &[BackendConfig]) -> Self {
        Self {
            targets: backends
                .iter()
                .map(|b| {
                    (
                        b.name.clone(),
                        BackendTarget {
                            name: b.name.clone(),
                            base_url: b.base_url.clone(),
                            timeout: b.timeout_ms.map(Duration::from_millis),
                        },
                    )
                })
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&BackendTarget> {
        self.targets.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.targets.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
