//! Circuit breaker for backend protection.
//!
//! # States
//! - Closed: normal operation, requests pass through
//! - Open: backend assumed down, requests fail fast
//! - Half-Open: trial calls decide whether the backend recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: failures within monitoring period >= failure_threshold
//! Open → Half-Open: first call after next_attempt
//! Half-Open → Closed: success_threshold successes
//! Half-Open → Open: any failure
//! ```
//!
//! # Design Decisions
//! - Per-backend circuit breaker (not global), created lazily by the registry
//! - Fail fast in Open state: the wrapped call is never invoked
//! - Each record + transition happens under one lock, so concurrent failures
//!   are never lost; the backend call itself runs outside the lock

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;
use crate::observability::metrics;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Returned instead of invoking the wrapped call while a circuit is open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit for backend '{backend}' is open")]
pub struct CircuitOpenError {
    pub backend: String,
    /// Time until the circuit admits a trial call.
    pub retry_after: Duration,
}

/// Outcome of [`CircuitBreaker::execute`] when the call does not succeed.
#[derive(Debug)]
pub enum CallError<E> {
    /// The call was rejected without being attempted.
    Open(CircuitOpenError),
    /// The call ran and failed; the failure has been recorded.
    Inner(E),
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    failures: VecDeque<Instant>,
    success_count: u32,
    next_attempt: Option<Instant>,
    last_transition: Instant,
    total_calls: u64,
    total_failures: u64,
    total_rejections: u64,
}

impl Circuit {
    fn new(now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            success_count: 0,
            next_attempt: None,
            last_transition: now,
            total_calls: 0,
            total_failures: 0,
            total_rejections: 0,
        }
    }

    fn prune(&mut self, now: Instant, period: Duration) {
        while let Some(oldest) = self.failures.front() {
            if now.duration_since(*oldest) > period {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Point-in-time view of one circuit, for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub backend: String,
    pub state: CircuitState,
    /// Failures inside the current monitoring period.
    pub recent_failures: usize,
    pub success_count: u32,
    pub total_calls: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
    pub retry_after_ms: Option<u64>,
    pub time_in_state_ms: u64,
}

/// Circuit breaker guarding a single named backend.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Circuit>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Circuit::new(Instant::now())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `f` under the breaker.
    ///
    /// Any `Err` returned by `f` counts as a failure.
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.try_acquire().map_err(CallError::Open)?;
        match f().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                self.on_failure();
                Err(CallError::Inner(e))
            }
        }
    }

    /// Admit or reject a call, moving Open → Half-Open once the timeout has passed.
    pub fn try_acquire(&self) -> Result<CircuitState, CircuitOpenError> {
        let now = Instant::now();
        let (state, half_opened) = {
            let mut circuit = self.inner.lock();
            let mut half_opened = false;

            if circuit.state == CircuitState::Open {
                if let Some(next) = circuit.next_attempt.filter(|next| now < *next) {
                    circuit.total_rejections += 1;
                    return Err(CircuitOpenError {
                        backend: self.name.clone(),
                        retry_after: next - now,
                    });
                }
                circuit.state = CircuitState::HalfOpen;
                circuit.success_count = 0;
                circuit.next_attempt = None;
                circuit.last_transition = now;
                half_opened = true;
            }

            circuit.total_calls += 1;
            (circuit.state, half_opened)
        };

        if half_opened {
            self.transitioned(CircuitState::HalfOpen);
        }
        Ok(state)
    }

    /// Record a successful call.
    pub fn on_success(&self) {
        let now = Instant::now();
        let closed = {
            let mut circuit = self.inner.lock();
            circuit.failures.clear();
            if circuit.state != CircuitState::HalfOpen {
                return;
            }
            circuit.success_count += 1;
            if circuit.success_count >= self.config.success_threshold {
                circuit.state = CircuitState::Closed;
                circuit.success_count = 0;
                circuit.last_transition = now;
                true
            } else {
                false
            }
        };
        if closed {
            self.transitioned(CircuitState::Closed);
        }
    }

    /// Record a failed call.
    pub fn on_failure(&self) {
        let now = Instant::now();
        let opened = {
            let mut circuit = self.inner.lock();
            circuit.total_failures += 1;
            circuit.failures.push_back(now);
            circuit.prune(now, self.config.monitoring_period());

            let trip = circuit.state == CircuitState::HalfOpen
                || circuit.failures.len() >= self.config.failure_threshold as usize;
            if !trip {
                return;
            }

            let was_open = circuit.state == CircuitState::Open;
            circuit.state = CircuitState::Open;
            circuit.success_count = 0;
            circuit.next_attempt = Some(now + self.config.open_timeout());
            if !was_open {
                circuit.last_transition = now;
            }
            !was_open
        };
        if opened {
            self.transitioned(CircuitState::Open);
        }
    }

    /// Current state without triggering the Open → Half-Open transition.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let now = Instant::now();
        let mut circuit = self.inner.lock();
        circuit.prune(now, self.config.monitoring_period());
        CircuitSnapshot {
            backend: self.name.clone(),
            state: circuit.state,
            recent_failures: circuit.failures.len(),
            success_count: circuit.success_count,
            total_calls: circuit.total_calls,
            total_failures: circuit.total_failures,
            total_rejections: circuit.total_rejections,
            retry_after_ms: circuit
                .next_attempt
                .map(|next| next.saturating_duration_since(now).as_millis() as u64),
            time_in_state_ms: now.duration_since(circuit.last_transition).as_millis() as u64,
        }
    }

    /// Force the circuit closed and clear its window. Lifetime counters are kept.
    pub fn reset(&self) {
        {
            let mut circuit = self.inner.lock();
            circuit.state = CircuitState::Closed;
            circuit.failures.clear();
            circuit.success_count = 0;
            circuit.next_attempt = None;
            circuit.last_transition = Instant::now();
        }
        tracing::info!(backend = %self.name, "Circuit breaker manually reset");
    }

    fn transitioned(&self, to: CircuitState) {
        match to {
            CircuitState::Open => tracing::warn!(
                backend = %self.name,
                threshold = self.config.failure_threshold,
                open_timeout_ms = self.config.open_timeout_ms,
                "Circuit breaker opened"
            ),
            CircuitState::HalfOpen => {
                tracing::info!(backend = %self.name, "Circuit breaker half-open, allowing trial calls")
            }
            CircuitState::Closed => tracing::info!(backend = %self.name, "Circuit breaker closed"),
        }
        metrics::record_circuit_transition(&self.name, to);
    }
}

/// Registry of circuit breakers keyed by backend name.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    defaults: CircuitBreakerConfig,
    overrides: HashMap<String, CircuitBreakerConfig>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self {
            defaults,
            overrides: HashMap::new(),
            breakers: DashMap::new(),
        }
    }

    /// Use `config` instead of the defaults for `backend`.
    pub fn with_override(mut self, backend: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        self.overrides.insert(backend.into(), config);
        self
    }

    /// Get or lazily create the breaker for `backend`.
    pub fn get(&self, backend: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(backend) {
            return breaker.clone();
        }
        self.breakers
            .entry(backend.to_string())
            .or_insert_with(|| {
                let config = self.overrides.get(backend).unwrap_or(&self.defaults).clone();
                Arc::new(CircuitBreaker::new(backend, config))
            })
            .clone()
    }

    /// Snapshots of every known circuit, sorted by backend name.
    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let mut all: Vec<_> = self.breakers.iter().map(|b| b.value().snapshot()).collect();
        all.sort_by(|a, b| a.backend.cmp(&b.backend));
        all
    }

    pub fn open_count(&self) -> usize {
        self.breakers
            .iter()
            .filter(|b| b.value().state() == CircuitState::Open)
            .count()
    }

    /// Reset one circuit. Returns false when no circuit exists for `backend`.
    pub fn reset(&self, backend: &str) -> bool {
        match self.breakers.get(backend) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Reset every circuit, returning how many were reset.
    pub fn reset_all(&self) -> usize {
        let breakers: Vec<_> = self.breakers.iter().map(|b| b.value().clone()).collect();
        for breaker in &breakers {
            breaker.reset();
        }
        breakers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            open_timeout_ms: 1_000,
            monitoring_period_ms: 10_000,
        }
    }

    async fn fail(cb: &CircuitBreaker, calls: &AtomicU32) -> Result<(), CallError<&'static str>> {
        cb.execute(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>("boom")
        })
        .await
    }

    async fn succeed(cb: &CircuitBreaker, calls: &AtomicU32) -> Result<(), CallError<&'static str>> {
        cb.execute(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<(), &'static str>(())
        })
        .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_fails_fast() {
        let cb = CircuitBreaker::new("x", test_config());
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            assert!(matches!(fail(&cb, &calls).await, Err(CallError::Inner(_))));
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        match fail(&cb, &calls).await {
            Err(CallError::Open(e)) => {
                assert_eq!(e.backend, "x");
                assert!(e.retry_after <= Duration::from_millis(1_000));
            }
            other => panic!("expected open circuit, got {:?}", other),
        }
        // the wrapped call was not invoked
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_monitoring_period_are_pruned() {
        let cb = CircuitBreaker::new("x", test_config());
        let calls = AtomicU32::new(0);

        let _ = fail(&cb, &calls).await;
        let _ = fail(&cb, &calls).await;
        tokio::time::advance(Duration::from_millis(10_001)).await;
        let _ = fail(&cb, &calls).await;

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().recent_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_recovery() {
        let cb = CircuitBreaker::new("x", test_config());
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            let _ = fail(&cb, &calls).await;
        }

        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert!(succeed(&cb, &calls).await.is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(succeed(&cb, &calls).await.is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = CircuitBreaker::new("x", test_config());
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            let _ = fail(&cb, &calls).await;
        }

        tokio::time::advance(Duration::from_millis(1_500)).await;
        assert!(matches!(fail(&cb, &calls).await, Err(CallError::Inner(_))));
        assert_eq!(cb.state(), CircuitState::Open);

        let before = calls.load(Ordering::SeqCst);
        assert!(matches!(succeed(&cb, &calls).await, Err(CallError::Open(_))));
        assert_eq!(calls.load(Ordering::SeqCst), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_clears_failure_window() {
        let cb = CircuitBreaker::new("x", test_config());
        let calls = AtomicU32::new(0);

        let _ = fail(&cb, &calls).await;
        let _ = fail(&cb, &calls).await;
        let _ = succeed(&cb, &calls).await;
        let _ = fail(&cb, &calls).await;
        let _ = fail(&cb, &calls).await;

        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_failures_are_not_lost() {
        let cb = Arc::new(CircuitBreaker::new(
            "x",
            CircuitBreakerConfig {
                failure_threshold: 50,
                ..test_config()
            },
        ));
        let mut tasks = Vec::new();
        for _ in 0..50 {
            let cb = cb.clone();
            tasks.push(tokio::spawn(async move {
                let _ = cb.execute(|| async { Err::<(), _>(()) }).await;
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.snapshot().total_failures, 50);
    }

    #[tokio::test]
    async fn test_registry_lazy_creation_and_overrides() {
        let registry = CircuitBreakerRegistry::new(test_config()).with_override(
            "slow",
            CircuitBreakerConfig {
                failure_threshold: 1,
                ..test_config()
            },
        );

        let a1 = registry.get("users");
        let a2 = registry.get("users");
        let slow = registry.get("slow");
        assert!(Arc::ptr_eq(&a1, &a2));
        assert_eq!(a1.config().failure_threshold, 3);
        assert_eq!(slow.config().failure_threshold, 1);

        slow.on_failure();
        assert_eq!(registry.open_count(), 1);
        assert_eq!(registry.snapshot().len(), 2);

        assert!(registry.reset("slow"));
        assert!(!registry.reset("unknown"));
        assert_eq!(registry.open_count(), 0);
        assert_eq!(registry.reset_all(), 2);
    }
}
