//! Store-backed lock provider.
//!
//! One record per resource under `lock/{resource}`, carrying the holder
//! token and the expiry, with the record-level TTL set to the same
//! instant. Acquisition is insert-if-absent via compare-and-swap: the
//! store treats an expired record as absent, so a lapsed lock is taken
//! over without an explicit delete.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::domain::LockToken;
use crate::error::ConveyorError;
use crate::lock::{Lock, LockProvider};
use crate::ports::clock::{delta, Clock, SystemClock};
use crate::ports::store::{KeyValueStore, StoreError};

/// Bounds for the randomized pause between acquisition attempts. Jitter
/// keeps a pack of contending acquirers from hammering the store in
/// lockstep.
const RETRY_PAUSE_MIN: Duration = Duration::from_millis(10);
const RETRY_PAUSE_MAX: Duration = Duration::from_millis(25);

#[derive(Debug, Serialize, Deserialize)]
struct LockRecord {
    token: LockToken,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

pub struct StoreLockProvider {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
}

impl StoreLockProvider {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn lock_key(resource: &str) -> String {
        format!("lock/{resource}")
    }

    /// Single acquisition attempt. `Ok(None)` means someone else holds
    /// the record.
    async fn try_acquire(
        &self,
        resource: &str,
        lease_duration: Duration,
    ) -> Result<Option<Lock>, ConveyorError> {
        let now = self.clock.now();
        let expires_at = now + delta(lease_duration);
        let token = LockToken::generate();
        let record = LockRecord {
            token,
            acquired_at: now,
            expires_at,
        };
        let value = serde_json::to_value(&record)?;

        match self
            .store
            .compare_and_swap(&Self::lock_key(resource), None, value, Some(expires_at))
            .await
        {
            Ok(_) => {
                debug!(resource, %token, "lock acquired");
                Ok(Some(Lock {
                    resource: resource.to_string(),
                    token,
                    acquired_at: now,
                    expires_at,
                }))
            }
            Err(StoreError::VersionConflict { .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl LockProvider for StoreLockProvider {
    async fn acquire(
        &self,
        resource: &str,
        lease_duration: Duration,
        acquire_timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<Option<Lock>, ConveyorError> {
        let deadline = tokio::time::Instant::now() + acquire_timeout;

        loop {
            if let Some(lock) = self.try_acquire(resource, lease_duration).await? {
                return Ok(Some(lock));
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            let pause = rand::thread_rng().gen_range(RETRY_PAUSE_MIN..=RETRY_PAUSE_MAX);
            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(pause.min(remaining)) => {}
            }
        }
    }

    async fn release(&self, lock: &Lock) -> Result<(), ConveyorError> {
        let key = Self::lock_key(&lock.resource);
        let Some(found) = self.store.get(&key).await? else {
            return Ok(());
        };

        let record: LockRecord = serde_json::from_value(found.value)?;
        if record.token != lock.token {
            // Lapsed and re-acquired by someone else; nothing of ours left.
            return Ok(());
        }

        // remove_if guards against the record changing hands between the
        // read and the delete.
        self.store.remove_if(&key, found.version).await?;
        debug!(resource = %lock.resource, token = %lock.token, "lock released");
        Ok(())
    }

    async fn renew(&self, lock: &Lock, extension: Duration) -> Result<Lock, ConveyorError> {
        let key = Self::lock_key(&lock.resource);
        let found = self
            .store
            .get(&key)
            .await?
            .ok_or_else(|| ConveyorError::LockLost(lock.resource.clone()))?;

        let record: LockRecord = serde_json::from_value(found.value)?;
        if record.token != lock.token {
            return Err(ConveyorError::LockLost(lock.resource.clone()));
        }

        let now = self.clock.now();
        let expires_at = now + delta(extension);
        let renewed = LockRecord {
            token: lock.token,
            acquired_at: record.acquired_at,
            expires_at,
        };
        let value = serde_json::to_value(&renewed)?;

        match self
            .store
            .compare_and_swap(&key, Some(found.version), value, Some(expires_at))
            .await
        {
            Ok(_) => Ok(Lock {
                resource: lock.resource.clone(),
                token: lock.token,
                acquired_at: record.acquired_at,
                expires_at,
            }),
            Err(StoreError::VersionConflict { .. }) => {
                Err(ConveyorError::LockLost(lock.resource.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn is_locked(&self, resource: &str) -> Result<bool, ConveyorError> {
        Ok(self.store.get(&Self::lock_key(resource)).await?.is_some())
    }
}
