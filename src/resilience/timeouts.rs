//! Deadline enforcement.
//!
//! A dispatch owns one deadline shared by all of its attempts. The attempt
//! future is dropped when the deadline passes, which aborts the in-flight
//! request and returns its connection to the pool.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("deadline exceeded")]
pub struct DeadlineExceeded;

/// Absolute deadline for a unit of work.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// Run `fut` until it completes or the deadline passes.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, DeadlineExceeded> {
        tokio::time::timeout_at(self.at, fut)
            .await
            .map_err(|_| DeadlineExceeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cancels_slow_future() {
        let deadline = Deadline::after(Duration::from_millis(100));
        let result = deadline
            .run(tokio::time::sleep(Duration::from_secs(5)))
            .await;
        assert_eq!(result, Err(DeadlineExceeded));
        assert!(deadline.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_is_shared_across_attempts() {
        let deadline = Deadline::after(Duration::from_millis(100));
        let first = deadline.run(tokio::time::sleep(Duration::from_millis(60))).await;
        assert!(first.is_ok());
        assert!(deadline.remaining() <= Duration::from_millis(40));

        let second = deadline.run(tokio::time::sleep(Duration::from_millis(60))).await;
        assert_eq!(second, Err(DeadlineExceeded));
    }
}
