//! Sliding-window throttling in front of a lock provider.
//!
//! Keeps a log of recent grant timestamps per resource under
//! `throttle/{resource}` and refuses new grants once `limit` grants have
//! landed inside the trailing `window`. Admission is decided before the
//! inner provider is consulted, and a denial is immediate: a caller at
//! capacity gets `Ok(None)` without waiting out its acquire timeout, so
//! it can put the work back and move on.
//!
//! The grant log is pruned and appended in one compare-and-swap, which
//! makes the limit hold across processes sharing the store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::cancel::CancelToken;
use crate::config::ThrottleConfig;
use crate::error::ConveyorError;
use crate::lock::{Lock, LockProvider};
use crate::ports::clock::{delta, Clock, SystemClock};
use crate::ports::store::{KeyValueStore, StoreError};

pub struct ThrottlingLockProvider {
    inner: Arc<dyn LockProvider>,
    store: Arc<dyn KeyValueStore>,
    config: ThrottleConfig,
    clock: Arc<dyn Clock>,
}

impl ThrottlingLockProvider {
    pub fn new(
        inner: Arc<dyn LockProvider>,
        store: Arc<dyn KeyValueStore>,
        config: ThrottleConfig,
    ) -> Self {
        Self {
            inner,
            store,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn throttle_key(resource: &str) -> String {
        format!("throttle/{resource}")
    }

    /// Record one grant in the sliding window. Returns false when the
    /// window is already at capacity.
    async fn admit(&self, resource: &str) -> Result<bool, ConveyorError> {
        let key = Self::throttle_key(resource);

        loop {
            let now = self.clock.now();
            let cutoff = now - delta(self.config.window);
            let found = self.store.get(&key).await?;

            let (mut grants, expected) = match &found {
                Some(record) => {
                    let grants: Vec<DateTime<Utc>> =
                        serde_json::from_value(record.value.clone())?;
                    (grants, Some(record.version))
                }
                None => (Vec::new(), None),
            };

            grants.retain(|granted_at| *granted_at > cutoff);
            if grants.len() >= self.config.limit as usize {
                debug!(
                    resource,
                    limit = self.config.limit,
                    "throttle window at capacity"
                );
                return Ok(false);
            }
            grants.push(now);

            // The log becomes garbage once every entry has aged out of
            // the window.
            let expires_at = now + delta(self.config.window);
            let value = serde_json::to_value(&grants)?;
            match self
                .store
                .compare_and_swap(&key, expected, value, Some(expires_at))
                .await
            {
                Ok(_) => return Ok(true),
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }
}

#[async_trait]
impl LockProvider for ThrottlingLockProvider {
    async fn acquire(
        &self,
        resource: &str,
        lease_duration: Duration,
        acquire_timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<Option<Lock>, ConveyorError> {
        if !self.admit(resource).await? {
            return Ok(None);
        }
        self.inner
            .acquire(resource, lease_duration, acquire_timeout, cancel)
            .await
    }

    async fn release(&self, lock: &Lock) -> Result<(), ConveyorError> {
        // Grants are time-based, not refunded on release.
        self.inner.release(lock).await
    }

    async fn renew(&self, lock: &Lock, extension: Duration) -> Result<Lock, ConveyorError> {
        // Renewal keeps an existing grant alive; it does not consume a
        // new one.
        self.inner.renew(lock, extension).await
    }

    async fn is_locked(&self, resource: &str) -> Result<bool, ConveyorError> {
        self.inner.is_locked(resource).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryStore;
    use crate::lock::StoreLockProvider;
    use crate::ports::clock::FixedClock;

    fn throttled(
        limit: u32,
        window: Duration,
        clock: Arc<FixedClock>,
    ) -> ThrottlingLockProvider {
        let store: Arc<dyn KeyValueStore> = Arc::new(InMemoryStore::with_clock(clock.clone()));
        let inner = Arc::new(
            StoreLockProvider::new(Arc::clone(&store)).with_clock(clock.clone()),
        );
        ThrottlingLockProvider::new(inner, store, ThrottleConfig::new(limit, window))
            .with_clock(clock)
    }

    #[tokio::test]
    async fn grants_up_to_the_limit_then_denies() {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let provider = throttled(3, Duration::from_secs(60), clock);
        let cancel = CancelToken::never();

        for _ in 0..3 {
            let lock = provider
                .acquire("db", Duration::from_secs(5), Duration::ZERO, &cancel)
                .await
                .unwrap()
                .expect("inside the window limit");
            provider.release(&lock).await.unwrap();
        }

        let denied = provider
            .acquire("db", Duration::from_secs(5), Duration::ZERO, &cancel)
            .await
            .unwrap();
        assert!(denied.is_none());
    }

    #[tokio::test]
    async fn denial_is_immediate_even_with_a_long_acquire_timeout() {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let provider = throttled(1, Duration::from_secs(60), clock);
        let cancel = CancelToken::never();

        let lock = provider
            .acquire("db", Duration::from_secs(5), Duration::ZERO, &cancel)
            .await
            .unwrap()
            .unwrap();
        provider.release(&lock).await.unwrap();

        let started = tokio::time::Instant::now();
        let denied = provider
            .acquire("db", Duration::from_secs(5), Duration::from_secs(30), &cancel)
            .await
            .unwrap();
        assert!(denied.is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn window_expiry_frees_capacity() {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let provider = throttled(2, Duration::from_secs(60), clock.clone());
        let cancel = CancelToken::never();

        for _ in 0..2 {
            let lock = provider
                .acquire("db", Duration::from_secs(5), Duration::ZERO, &cancel)
                .await
                .unwrap()
                .unwrap();
            provider.release(&lock).await.unwrap();
        }
        assert!(provider
            .acquire("db", Duration::from_secs(5), Duration::ZERO, &cancel)
            .await
            .unwrap()
            .is_none());

        clock.advance(Duration::from_secs(61));

        let lock = provider
            .acquire("db", Duration::from_secs(5), Duration::ZERO, &cancel)
            .await
            .unwrap();
        assert!(lock.is_some());
    }

    #[tokio::test]
    async fn resources_are_throttled_independently() {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let provider = throttled(1, Duration::from_secs(60), clock);
        let cancel = CancelToken::never();

        let db = provider
            .acquire("db", Duration::from_secs(5), Duration::ZERO, &cancel)
            .await
            .unwrap()
            .unwrap();
        provider.release(&db).await.unwrap();

        assert!(provider
            .acquire("db", Duration::from_secs(5), Duration::ZERO, &cancel)
            .await
            .unwrap()
            .is_none());
        assert!(provider
            .acquire("cache", Duration::from_secs(5), Duration::ZERO, &cancel)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn a_denied_grant_is_not_recorded() {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let provider = throttled(1, Duration::from_secs(60), clock.clone());
        let cancel = CancelToken::never();

        let lock = provider
            .acquire("db", Duration::from_secs(5), Duration::ZERO, &cancel)
            .await
            .unwrap()
            .unwrap();
        provider.release(&lock).await.unwrap();

        // Repeated denials must not extend the wait for the next grant.
        for _ in 0..5 {
            assert!(provider
                .acquire("db", Duration::from_secs(5), Duration::ZERO, &cancel)
                .await
                .unwrap()
                .is_none());
        }

        clock.advance(Duration::from_secs(61));
        assert!(provider
            .acquire("db", Duration::from_secs(5), Duration::ZERO, &cancel)
            .await
            .unwrap()
            .is_some());
    }
}
