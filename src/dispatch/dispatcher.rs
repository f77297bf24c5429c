//! Request dispatch: cache, circuit, deadline, retry, side effects.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{header::CONTENT_TYPE, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::CacheStore;
use crate::dispatch::error::DispatchError;
use crate::dispatch::request::DispatchRequest;
use crate::dispatch::transport::{BackendRegistry, BackendResponse, BackendTarget, BackendTransport, OutboundRequest, TransportError};
use crate::observability::metrics;
use crate::realtime::FanoutHub;
use crate::resilience::retries::is_retryable;
use crate::resilience::timeouts::Deadline;
use crate::resilience::{CallError, CircuitBreaker, CircuitBreakerRegistry, CircuitState};

/// Outcome of a successful dispatch.
#[derive(Debug, Clone)]
pub struct DispatchResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body: Bytes,
    /// Served from cache without a backend call.
    pub cached: bool,
    /// Circuit state when the backend was called, or now for cache hits.
    pub circuit_state: CircuitState,
}

/// What gets cached for a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredResponse {
    status: u16,
    content_type: Option<String>,
    body: Vec<u8>,
}

impl From<&BackendResponse> for StoredResponse {
    fn from(response: &BackendResponse) -> Self {
        Self {
            status: response.status.as_u16(),
            content_type: response
                .headers
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            body: response.body.to_vec(),
        }
    }
}

/// Why one attempt failed.
enum AttemptError {
    Status(BackendResponse),
    Transport(TransportError),
    Timeout,
}

pub struct Dispatcher {
    backends: BackendRegistry,
    transport: Arc<dyn BackendTransport>,
    breakers: Arc<CircuitBreakerRegistry>,
    cache: Arc<CacheStore>,
    hub: Option<Arc<FanoutHub>>,
    default_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        backends: BackendRegistry,
        transport: Arc<dyn BackendTransport>,
        breakers: Arc<CircuitBreakerRegistry>,
        cache: Arc<CacheStore>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            backends,
            transport,
            breakers,
            cache,
            hub: None,
            default_timeout,
        }
    }

    /// Enable write notifications through `hub`.
    pub fn with_hub(mut self, hub: Arc<FanoutHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn backends(&self) -> &BackendRegistry {
        &self.backends
    }

    pub async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchResponse, DispatchError> {
        let target = self
            .backends
            .get(&request.backend)
            .ok_or_else(|| DispatchError::UnknownBackend(request.backend.clone()))?;
        let timeout = request
            .options()
            .timeout
            .or(target.timeout)
            .unwrap_or(self.default_timeout);
        let breaker = self.breakers.get(&target.name);

        let response = match &request.options().cache {
            Some(policy) => {
                let key = request.cache_key();
                let mut state_at_call = None;
                let (breaker_ref, request_ref, state_slot) = (&breaker, &request, &mut state_at_call);
                let cached = self
                    .cache
                    .get_or_set(&key, policy.ttl, &policy.tags, || async move {
                        let (stored, state) = self.fetch(breaker_ref, target, request_ref, timeout).await?;
                        *state_slot = Some(state);
                        Ok::<_, DispatchError>(stored)
                    })
                    .await?;
                if cached.hit {
                    tracing::debug!(backend = %target.name, path = %request.path, "Served from cache");
                }
                into_response(cached.value, cached.hit, state_at_call.unwrap_or_else(|| breaker.state()))
            }
            None => {
                let (stored, state) = self.fetch(&breaker, target, &request, timeout).await?;
                into_response(stored, false, state)
            }
        };

        if request.is_write() {
            self.after_write(&request, &response).await;
        }
        Ok(response)
    }

    /// Call the backend under its breaker, retrying once where allowed.
    async fn fetch(
        &self,
        breaker: &CircuitBreaker,
        target: &BackendTarget,
        request: &DispatchRequest,
        timeout: Duration,
    ) -> Result<(StoredResponse, CircuitState), DispatchError> {
        let deadline = Deadline::after(timeout);
        let mut retries = 0;

        loop {
            let result = breaker
                .execute(|| self.attempt(breaker, target, request, deadline))
                .await;

            let error = match result {
                Ok((response, state)) => {
                    metrics::record_dispatch(&target.name, "success");
                    return Ok((StoredResponse::from(&response), state));
                }
                Err(CallError::Open(open)) => {
                    metrics::record_dispatch(&target.name, "rejected");
                    return Err(DispatchError::CircuitOpen {
                        backend: open.backend,
                        retry_after: open.retry_after,
                    });
                }
                Err(CallError::Inner(error)) => error,
            };

            match error {
                AttemptError::Transport(e)
                    if !deadline.is_expired()
                        && is_retryable(&request.method, e.is_connect(), retries, breaker.state()) =>
                {
                    retries += 1;
                    metrics::record_dispatch(&target.name, "retry");
                    tracing::info!(backend = %target.name, error = %e, "Retrying after connection failure");
                }
                AttemptError::Transport(e) => {
                    metrics::record_dispatch(&target.name, "transport_error");
                    tracing::warn!(backend = %target.name, error = %e, "Backend call failed");
                    return Err(DispatchError::Transport {
                        backend: target.name.clone(),
                        source: e,
                    });
                }
                AttemptError::Timeout => {
                    metrics::record_dispatch(&target.name, "timeout");
                    tracing::warn!(backend = %target.name, timeout_ms = timeout.as_millis() as u64, "Backend call timed out");
                    return Err(DispatchError::Timeout {
                        backend: target.name.clone(),
                        timeout,
                    });
                }
                AttemptError::Status(response) => {
                    metrics::record_dispatch(&target.name, "error_status");
                    tracing::debug!(backend = %target.name, status = %response.status, "Backend returned error status");
                    return Err(DispatchError::Backend {
                        backend: target.name.clone(),
                        status: response.status,
                        code: error_code(&response.body),
                    });
                }
            }
        }
    }

    async fn attempt(
        &self,
        breaker: &CircuitBreaker,
        target: &BackendTarget,
        request: &DispatchRequest,
        deadline: Deadline,
    ) -> Result<(BackendResponse, CircuitState), AttemptError> {
        let state = breaker.state();
        let outbound = OutboundRequest {
            url: target.url_for(&request.path),
            method: request.method.clone(),
            headers: request.headers.clone(),
            body: request.body.clone(),
        };

        match deadline.run(self.transport.send(outbound)).await {
            Err(_) => Err(AttemptError::Timeout),
            Ok(Err(e)) => Err(AttemptError::Transport(e)),
            Ok(Ok(response)) if response.status.is_success() => Ok((response, state)),
            Ok(Ok(response)) => Err(AttemptError::Status(response)),
        }
    }

    async fn after_write(&self, request: &DispatchRequest, response: &DispatchResponse) {
        for tag in &request.options().invalidate_tags {
            self.cache.invalidate_tag(tag).await;
        }

        if let (Some(hub), Some(notify)) = (&self.hub, &request.options().notify) {
            let payload = serde_json::from_slice::<Value>(&response.body).unwrap_or(Value::Null);
            let delivered = hub
                .broadcast(&notify.tenant_id, &notify.topic, &notify.event, payload)
                .await;
            tracing::debug!(topic = %notify.topic, event = %notify.event, delivered, "Write notification sent");
        }
    }
}

fn into_response(stored: StoredResponse, cached: bool, circuit_state: CircuitState) -> DispatchResponse {
    DispatchResponse {
        status: StatusCode::from_u16(stored.status).unwrap_or(StatusCode::OK),
        content_type: stored.content_type,
        body: Bytes::from(stored.body),
        cached,
        circuit_state,
    }
}

/// `code` or `error` string field of a JSON error body.
fn error_code(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    ["code", "error"]
        .iter()
        .find_map(|field| value.get(*field).and_then(Value::as_str))
        .map(|code| code.chars().take(64).collect())
}
