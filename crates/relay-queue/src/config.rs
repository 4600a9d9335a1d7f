//! Engine tuning knobs: lease TTL, stale-pending age, and retry backoff.
//!
//! All staleness decisions compare wall-clock timestamps against these
//! durations; no timer runs inside the engine itself.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Backoff between a step failure and the next claim eligibility.
///
/// The delay for attempt `n` (1-indexed) is `base * 2^(n-1)`, capped at
/// `max_delay`. `BackoffPolicy::none()` makes failed jobs immediately
/// re-eligible, which tests use to drive retries without a clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    #[serde(with = "humantime_serde")]
    pub base: Duration,
    /// Upper bound on any single delay.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

impl BackoffPolicy {
    /// Creates an exponential policy with the given base and cap.
    #[must_use]
    pub const fn exponential(base: Duration, max_delay: Duration) -> Self {
        Self { base, max_delay }
    }

    /// Creates a policy with no delay: failed jobs retry immediately.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            base: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Returns the delay before retry attempt `attempt` (1-indexed).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.base.is_zero() {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(16);
        let factor = 2u32.saturating_pow(exponent);
        self.base.saturating_mul(factor).min(self.max_delay)
    }

    /// Returns the instant at which retry attempt `attempt` becomes due.
    #[must_use]
    pub fn retry_at(&self, attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay_for(attempt))
            .unwrap_or_else(|_| chrono::Duration::MAX);
        now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(30), Duration::from_secs(3600))
    }
}

/// Tuning for one deployment of the queue engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    /// Heartbeat lease duration.
    ///
    /// A `Processing` job whose last heartbeat is older than this is
    /// considered abandoned. Sized at 30-60x the expected step duration so a
    /// live worker is never reclaimed mid-step.
    #[serde(with = "humantime_serde")]
    pub lease_ttl: Duration,

    /// How long a pending job may sit unclaimed before the reconciler flags
    /// it stale for operator visibility.
    #[serde(with = "humantime_serde")]
    pub pending_max_age: Duration,

    /// Retry backoff policy.
    pub backoff: BackoffPolicy,
}

impl QueueConfig {
    /// Returns the lease TTL as a chrono duration for timestamp arithmetic.
    #[must_use]
    pub fn lease_ttl_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.lease_ttl).unwrap_or_else(|_| chrono::Duration::MAX)
    }

    /// Returns the pending max-age as a chrono duration.
    #[must_use]
    pub fn pending_max_age_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.pending_max_age).unwrap_or_else(|_| chrono::Duration::MAX)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(600),
            pending_max_age: Duration::from_secs(3600),
            backoff: BackoffPolicy::default(),
        }
    }
}
