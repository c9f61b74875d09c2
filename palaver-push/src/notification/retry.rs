//! Fixed-delay retry for push deliveries.
//!
//! Each attempt is classified as delivered, transient (retried after the
//! backoff) or permanent (dropped). Sleeps race the cancellation token so a
//! torn-down module never leaves retry loops behind.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Retry configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per device, including the first.
    pub max_attempts: u32,
    /// Delay between attempts in milliseconds.
    pub backoff_ms: u64,
    /// Add random jitter of [0, backoff/2) to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 1000,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    /// Delay to wait before the next attempt.
    pub fn next_delay(&self) -> Duration {
        let base = self.backoff();
        if !self.jitter {
            return base;
        }

        let jitter_range_ms = self.backoff_ms / 2;
        if jitter_range_ms == 0 {
            return base;
        }

        let jitter_ms = rand::random::<u64>() % jitter_range_ms;
        base + Duration::from_millis(jitter_ms)
    }
}

/// Classification of a single push attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// HTTP 204.
    Delivered,
    /// Rate limit, server error or dropped connection.
    Transient(String),
    /// Any other status; never retried.
    Permanent(u16),
    /// The request could not be built; never retried.
    Unroutable(String),
}

impl AttemptOutcome {
    /// Classify an HTTP status code.
    pub fn from_status(status: u16) -> Self {
        match status {
            204 => Self::Delivered,
            429 => Self::Transient("rate limited (429)".to_string()),
            500..=599 => Self::Transient(format!("server error ({})", status)),
            other => Self::Permanent(other),
        }
    }
}

/// Final result of a device's delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Dropped after a permanent failure status.
    Rejected(u16),
    /// Every attempt failed transiently; carries the last reason.
    Exhausted(String),
    /// Abandoned because the owning scope was torn down.
    Cancelled,
    /// The device has no push endpoint or an unusable one.
    Unroutable,
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

/// Run `operation` until it is delivered, permanently fails, or attempts run out.
///
/// `operation` receives the 1-based attempt number. Returns the outcome and the
/// number of attempts made. An attempt interrupted by cancellation still counts.
pub async fn retry_with_backoff<F, Fut>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    mut operation: F,
) -> (DeliveryOutcome, u32)
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = AttemptOutcome>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        if token.is_cancelled() {
            return (DeliveryOutcome::Cancelled, attempt - 1);
        }

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => return (DeliveryOutcome::Cancelled, attempt),
            outcome = operation(attempt) => outcome,
        };

        match outcome {
            AttemptOutcome::Delivered => return (DeliveryOutcome::Delivered, attempt),
            AttemptOutcome::Permanent(status) => {
                return (DeliveryOutcome::Rejected(status), attempt);
            }
            AttemptOutcome::Unroutable(reason) => {
                debug!(attempt, reason = %reason, "Push request could not be sent");
                return (DeliveryOutcome::Unroutable, attempt);
            }
            AttemptOutcome::Transient(reason) => {
                if attempt >= max_attempts {
                    return (DeliveryOutcome::Exhausted(reason), attempt);
                }

                let delay = policy.next_delay();
                debug!(
                    attempt,
                    max = max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    reason = %reason,
                    "Retrying push after transient failure"
                );
                last_error = reason;

                tokio::select! {
                    biased;
                    _ = token.cancelled() => return (DeliveryOutcome::Cancelled, attempt),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    // The loop returns on its final iteration; this only guards max_attempts edge cases.
    (DeliveryOutcome::Exhausted(last_error), max_attempts)
}
