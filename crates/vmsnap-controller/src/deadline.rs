//! Failure deadline computation for snapshot requests.
//!
//! The deadline is anchored at the request's creation timestamp. A zero
//! duration disables it; an absent duration falls back to the configured
//! default. A duration past the representable range clamps to the latest
//! representable instant.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::warn;

/// Default failure deadline when a request does not carry one.
pub const DEFAULT_FAILURE_DEADLINE: Duration = Duration::from_secs(5 * 60);

/// Absolute point in time after which a request fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FailureDeadline {
    expiry: DateTime<Utc>,
}

impl FailureDeadline {
    /// Resolves the deadline for a request created at `created`.
    ///
    /// Returns `None` only when the effective duration is zero.
    pub fn resolve(
        created: DateTime<Utc>,
        requested: Option<Duration>,
        default: Duration,
    ) -> Option<Self> {
        let timeout = requested.unwrap_or(default);
        if timeout.is_zero() {
            return None;
        }
        let expiry = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|delta| created.checked_add_signed(delta))
            .unwrap_or_else(|| {
                warn!(
                    timeout_secs = timeout.as_secs(),
                    "failure deadline out of range, clamping"
                );
                DateTime::<Utc>::MAX_UTC
            });
        Some(Self { expiry })
    }

    /// Returns the expiry time.
    pub fn expiry(&self) -> DateTime<Utc> {
        self.expiry
    }

    /// Returns `true` if the deadline has passed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry
    }

    /// Returns the remaining time at `now`, or `None` once expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        if self.is_expired(now) {
            return None;
        }
        (self.expiry - now).to_std().ok()
    }
}
