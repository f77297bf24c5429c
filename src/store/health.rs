//! Degraded-mode tracking for an optional dependency.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Tracks whether a dependency is usable.
///
/// Transitions are logged exactly once each way. After a failure the
/// dependency is skipped until `cooldown` has passed.
#[derive(Debug)]
pub struct StoreHealth {
    name: &'static str,
    degraded: AtomicBool,
    retry_at: Mutex<Option<Instant>>,
    cooldown: Duration,
}

impl StoreHealth {
    pub fn new(name: &'static str, cooldown: Duration) -> Self {
        Self {
            name,
            degraded: AtomicBool::new(false),
            retry_at: Mutex::new(None),
            cooldown,
        }
    }

    /// False while inside the cooldown that follows a failure.
    pub fn should_try(&self) -> bool {
        match *self.retry_at.lock() {
            Some(at) => Instant::now() >= at,
            None => true,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn record_ok(&self) {
        if self.degraded.swap(false, Ordering::Relaxed) {
            *self.retry_at.lock() = None;
            tracing::info!(dependency = self.name, "Dependency recovered, leaving degraded mode");
        }
    }

    pub fn record_err(&self, error: &dyn std::fmt::Display) {
        *self.retry_at.lock() = Some(Instant::now() + self.cooldown);
        if !self.degraded.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                dependency = self.name,
                error = %error,
                cooldown_ms = self.cooldown.as_millis() as u64,
                "Dependency unavailable, entering degraded mode"
            );
        }
    }
}
