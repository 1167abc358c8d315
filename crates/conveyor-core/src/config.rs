//! Runtime configuration.

use std::time::Duration;

use crate::queue::RetryPolicy;

/// Per-queue tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    /// Dequeue visibility timeout: how long a lease lasts before the entry
    /// becomes reclaimable by other dequeuers.
    pub lease_duration: Duration,

    pub retry: RetryPolicy,
}

impl QueueConfig {
    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.retry.max_attempts = max_attempts;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry.retry_delay = retry_delay;
        self
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

/// Sliding-window cap for the throttling lock provider: at most `limit`
/// grants of one resource within any trailing `window`.
#[derive(Debug, Clone, Copy)]
pub struct ThrottleConfig {
    pub limit: u32,
    pub window: Duration,
}

impl ThrottleConfig {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self { limit, window }
    }
}
