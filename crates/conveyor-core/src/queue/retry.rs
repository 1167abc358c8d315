//! Retry policy for abandoned entries.

use std::time::Duration;

/// Governs the requeue-or-deadletter decision on abandon.
///
/// An abandoned entry is requeued while `attempts <= max_attempts`, then
/// deadlettered. The delay is fixed per abandon, no backoff curve: retries
/// here come from contention and transient faults, and a flat short delay
/// keeps the drain loop's behavior predictable.
///
/// `retry_delay` is a floor, not a schedule: a requeued entry becomes
/// eligible *no earlier than* now + delay, and is picked up whenever a
/// dequeuer next scans after that point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retry budget. `attempts` beyond `max_attempts` means deadletter.
    pub max_attempts: u32,

    /// Floor on the time between an abandon and re-eligibility.
    pub retry_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            max_attempts,
            retry_delay,
        }
    }

    /// Should an entry with this many lease grants be requeued on abandon?
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts <= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_millis(0),
        }
    }
}
