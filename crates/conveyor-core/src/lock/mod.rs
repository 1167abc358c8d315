//! Distributed mutual exclusion over the backing store.
//!
//! Design intent:
//! - A lock is a store record with a TTL and a holder token. Expiry is the
//!   only liveness mechanism: a crashed holder simply stops renewing and
//!   the record lapses, so there is no fencing beyond the token check.
//! - All contention resolves through compare-and-swap on the lock key.
//!   Whoever lands the insert owns the resource until the record expires
//!   or is released.
//! - Providers compose: the throttling provider wraps any inner provider
//!   and adds a sliding-window admission check in front of it.

pub mod store_lock;
pub mod throttle;

pub use store_lock::StoreLockProvider;
pub use throttle::ThrottlingLockProvider;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::cancel::CancelToken;
use crate::domain::LockToken;
use crate::error::ConveyorError;

/// A held lock. Proof of ownership is the token: release and renew both
/// check it against the stored record before acting.
#[derive(Debug, Clone)]
pub struct Lock {
    pub resource: String,
    pub token: LockToken,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Mutual exclusion on named resources.
#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Try to take the lock, retrying until `acquire_timeout` elapses or
    /// `cancel` fires. `Ok(None)` means the lock stayed busy for the whole
    /// window, not an error.
    async fn acquire(
        &self,
        resource: &str,
        lease_duration: Duration,
        acquire_timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<Option<Lock>, ConveyorError>;

    /// Release a held lock. Releasing a lock that has already lapsed or
    /// been taken over is a no-op.
    async fn release(&self, lock: &Lock) -> Result<(), ConveyorError>;

    /// Push the expiry of a held lock out by `extension` from now.
    /// Fails with [`ConveyorError::LockLost`] when the record has lapsed
    /// or belongs to another holder.
    async fn renew(&self, lock: &Lock, extension: Duration) -> Result<Lock, ConveyorError>;

    /// Whether the resource is currently held by anyone.
    async fn is_locked(&self, resource: &str) -> Result<bool, ConveyorError>;
}
