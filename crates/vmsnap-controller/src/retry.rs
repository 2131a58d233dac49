//! Optimistic-concurrency conflict retry with exponential backoff.
//!
//! Every store write is a compare-and-swap on the object's resource version.
//! A conflict means another writer got there first: re-read, re-apply and
//! try again. Conflicts never surface as operation failures unless the
//! retry budget is exhausted, in which case the caller requeues.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::error::Result;

/// Configuration for conflict retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first (default: 5).
    pub max_retries: u32,
    /// Initial backoff duration (default: 10ms).
    pub initial_backoff: Duration,
    /// Maximum backoff duration (default: 500ms).
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff (default: 2.0).
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(500),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Backoff before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

/// Runs `operation`, re-running it while it fails with a conflict.
///
/// The closure must re-read whatever it mutates on each call.
pub async fn retry_on_conflict<F, Fut, T>(config: &RetryConfig, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Err(e) if e.is_conflict() && attempt < config.max_retries => {
                let backoff = config.backoff(attempt);
                debug!(attempt, ?backoff, error = %e, "write conflict, retrying");
                attempt += 1;
                tokio::time::sleep(backoff).await;
            }
            other => return other,
        }
    }
}
