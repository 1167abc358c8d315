//! Work queue with leased dequeue, retry, and deadletter.
//!
//! Design intent:
//! - The backing store is the single source of truth. Every state
//!   transition is a version-checked compare-and-swap on one entry record,
//!   so any number of queue instances (across processes) can share a store
//!   without double-granting a lease.
//! - Entry keys embed the entry's ULID, so a sorted prefix scan yields
//!   FIFO-by-enqueue-time order for free.
//! - The in-process `Notify` is only a wakeup fast path for local waiters;
//!   remote waiters fall back to the poll interval. Correctness never
//!   depends on the notification.

pub mod record;
pub mod retry;
pub mod state;
pub mod stats;

pub use record::{EntryHandle, EntryRecord};
pub use retry::RetryPolicy;
pub use state::EntryState;
pub use stats::{LifetimeCounters, QueueStats};

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::config::QueueConfig;
use crate::domain::{EntryId, LeaseToken};
use crate::error::ConveyorError;
use crate::observer::{EventBus, QueueEvent, QueueObserver};
use crate::ports::clock::{Clock, SystemClock, delta};
use crate::ports::store::{KeyValueStore, StoreError};

/// Fallback rescan interval for waiters that miss a notification (remote
/// enqueuers, promoted retries, expiring leases).
const POLL_INTERVAL: Duration = Duration::from_millis(25);

pub struct Queue {
    name: String,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    bus: EventBus,
    notify: Arc<Notify>,
}

impl Queue {
    /// Must be called from within a tokio runtime (the observer bus spawns
    /// its dispatch task here).
    pub fn new(name: impl Into<String>, store: Arc<dyn KeyValueStore>, config: QueueConfig) -> Self {
        Self::with_observers(name, store, config, Vec::new())
    }

    pub fn with_observers(
        name: impl Into<String>,
        store: Arc<dyn KeyValueStore>,
        config: QueueConfig,
        observers: Vec<Arc<dyn QueueObserver>>,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            clock: Arc::new(SystemClock),
            config,
            bus: EventBus::start(observers),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Swap the clock. Intended for construction time, before any entries
    /// exist.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn entry_key(&self, id: EntryId) -> String {
        format!("{}/entry/{}", self.name, id.as_ulid())
    }

    fn entries_prefix(&self) -> String {
        format!("{}/entry/", self.name)
    }

    fn counters_key(&self) -> String {
        format!("{}/counters", self.name)
    }

    /// Add a new entry. It starts `Queued` with zero attempts.
    pub async fn enqueue(&self, payload: Value) -> Result<EntryId, ConveyorError> {
        let now = self.clock.now();
        let id = EntryId::generate();
        let record = EntryRecord::new(id, payload, now);

        self.store
            .put(&self.entry_key(id), serde_json::to_value(&record)?, None)
            .await?;
        self.bump_counters(|c| c.enqueued += 1).await?;

        self.bus.publish(QueueEvent::Enqueued { id, at: now });
        self.notify.notify_one();
        debug!(queue = %self.name, entry = %id, "enqueued");
        Ok(id)
    }

    /// Lease the oldest eligible entry, waiting up to `timeout` for one to
    /// appear. `Ok(None)` means empty-or-timeout, never an error.
    ///
    /// Eligible entries are `Queued`, `Abandoned` past their retry delay,
    /// and `Leased` past their lease window (reclamation: a crashed holder
    /// cannot strand work). The grant increments `attempts` and stamps a
    /// fresh lease token into the returned handle.
    pub async fn dequeue(
        &self,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<Option<EntryHandle>, ConveyorError> {
        let deadline = Instant::now() + timeout;
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }

            if let Some(handle) = self.try_dequeue().await? {
                return Ok(Some(handle));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = POLL_INTERVAL.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// One non-blocking scan-and-claim pass.
    async fn try_dequeue(&self) -> Result<Option<EntryHandle>, ConveyorError> {
        let now = self.clock.now();
        let entries = self.store.scan_prefix(&self.entries_prefix()).await?;

        for (key, stored) in entries {
            let mut record: EntryRecord = serde_json::from_value(stored.value)?;
            if !record.is_eligible(now) {
                continue;
            }

            let token = LeaseToken::generate();
            record.begin_lease(token, now, now + delta(self.config.lease_duration));

            match self
                .store
                .compare_and_swap(&key, Some(stored.version), serde_json::to_value(&record)?, None)
                .await
            {
                Ok(_) => {
                    self.bump_counters(|c| c.dequeued += 1).await?;
                    self.bus.publish(QueueEvent::Dequeued {
                        id: record.id,
                        at: now,
                        attempt: record.attempts,
                    });
                    debug!(
                        queue = %self.name,
                        entry = %record.id,
                        attempt = record.attempts,
                        "leased"
                    );
                    return Ok(Some(EntryHandle {
                        id: record.id,
                        payload: record.payload,
                        attempt: record.attempts,
                        lease_token: token,
                    }));
                }
                // Another dequeuer claimed this entry first; try the next.
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(None)
    }

    /// Retire the entry as successfully processed.
    ///
    /// Legal only while the handle's lease is current; otherwise
    /// [`ConveyorError::StaleLease`] tells the caller its result was not
    /// recorded (and the work may run again elsewhere).
    pub async fn complete(&self, handle: &EntryHandle) -> Result<(), ConveyorError> {
        let now = self.clock.now();
        let key = self.entry_key(handle.id);
        let Some(stored) = self.store.get(&key).await? else {
            return Err(ConveyorError::EntryNotFound(handle.id));
        };

        let mut record: EntryRecord = serde_json::from_value(stored.value)?;
        if !record.holds_lease(handle.lease_token, now) {
            return Err(ConveyorError::StaleLease(handle.id));
        }
        record.mark_completed(now);

        match self
            .store
            .compare_and_swap(&key, Some(stored.version), serde_json::to_value(&record)?, None)
            .await
        {
            Ok(_) => {}
            // Lost to a reclaimer between the lease check and the write.
            Err(StoreError::VersionConflict { .. }) => {
                return Err(ConveyorError::StaleLease(handle.id));
            }
            Err(err) => return Err(err.into()),
        }

        self.bump_counters(|c| c.completed += 1).await?;
        self.bus.publish(QueueEvent::Completed {
            id: handle.id,
            at: now,
        });
        debug!(queue = %self.name, entry = %handle.id, "completed");
        Ok(())
    }

    /// Give the entry back: requeue after the retry delay while the budget
    /// lasts, deadletter once it is spent.
    ///
    /// Same lease-currency rules as [`Queue::complete`]. `reason` lands in
    /// the record's `last_error` and counts toward the `errors` stat;
    /// reason-less abandons (lock denial, cancellation) do not.
    pub async fn abandon(
        &self,
        handle: &EntryHandle,
        reason: Option<&str>,
    ) -> Result<(), ConveyorError> {
        let now = self.clock.now();
        let key = self.entry_key(handle.id);
        let Some(stored) = self.store.get(&key).await? else {
            return Err(ConveyorError::EntryNotFound(handle.id));
        };

        let mut record: EntryRecord = serde_json::from_value(stored.value)?;
        if !record.holds_lease(handle.lease_token, now) {
            return Err(ConveyorError::StaleLease(handle.id));
        }

        let requeued = self.config.retry.allows_retry(record.attempts);
        if requeued {
            let not_before = now + delta(self.config.retry.retry_delay);
            record.mark_abandoned(now, not_before, reason.map(str::to_string));
        } else {
            record.mark_deadlettered(now, reason.map(str::to_string));
        }
        let attempts = record.attempts;

        match self
            .store
            .compare_and_swap(&key, Some(stored.version), serde_json::to_value(&record)?, None)
            .await
        {
            Ok(_) => {}
            Err(StoreError::VersionConflict { .. }) => {
                return Err(ConveyorError::StaleLease(handle.id));
            }
            Err(err) => return Err(err.into()),
        }

        self.bump_counters(|c| {
            c.abandoned += 1;
            if reason.is_some() {
                c.errors += 1;
            }
            if !requeued {
                c.deadlettered += 1;
            }
        })
        .await?;

        self.bus.publish(QueueEvent::Abandoned {
            id: handle.id,
            at: now,
            attempts,
        });
        if requeued {
            self.notify.notify_one();
            debug!(queue = %self.name, entry = %handle.id, attempts, "abandoned, requeued");
        } else {
            self.bus.publish(QueueEvent::Deadlettered {
                id: handle.id,
                at: now,
                attempts,
            });
            debug!(queue = %self.name, entry = %handle.id, attempts, "deadlettered");
        }
        Ok(())
    }

    /// Point-in-time snapshot. Lifetime counters come from the counters
    /// record; `queued`/`working` are derived from the entry population.
    /// Entries waiting out a retry delay count as `queued`, as do expired
    /// leases awaiting reclamation.
    pub async fn stats(&self) -> Result<QueueStats, ConveyorError> {
        let now = self.clock.now();
        let counters = self.load_counters().await?;

        let mut queued = 0u64;
        let mut working = 0u64;
        for (_, stored) in self.store.scan_prefix(&self.entries_prefix()).await? {
            let record: EntryRecord = serde_json::from_value(stored.value)?;
            match record.state {
                EntryState::Queued | EntryState::Abandoned => queued += 1,
                EntryState::Leased => {
                    if record.lease_expires_at.is_some_and(|t| t <= now) {
                        queued += 1;
                    } else {
                        working += 1;
                    }
                }
                EntryState::Completed | EntryState::Deadlettered => {}
            }
        }

        Ok(QueueStats::from_parts(counters, queued, working))
    }

    /// Discard all entries and reset counters. Isolation aid for tests and
    /// tooling, not a production operation.
    pub async fn purge(&self) -> Result<(), ConveyorError> {
        let prefix = format!("{}/", self.name);
        for (key, _) in self.store.scan_prefix(&prefix).await? {
            self.store.remove(&key).await?;
        }
        Ok(())
    }

    async fn load_counters(&self) -> Result<LifetimeCounters, ConveyorError> {
        match self.store.get(&self.counters_key()).await? {
            Some(stored) => Ok(serde_json::from_value(stored.value)?),
            None => Ok(LifetimeCounters::default()),
        }
    }

    /// CAS loop on the counters record. Contention here is short-lived:
    /// every transition touches it once.
    async fn bump_counters(
        &self,
        apply: impl Fn(&mut LifetimeCounters),
    ) -> Result<(), ConveyorError> {
        let key = self.counters_key();
        loop {
            let stored = self.store.get(&key).await?;
            let (expected, mut counters) = match &stored {
                Some(rec) => (Some(rec.version), serde_json::from_value(rec.value.clone())?),
                None => (None, LifetimeCounters::default()),
            };
            apply(&mut counters);

            match self
                .store
                .compare_and_swap(&key, expected, serde_json::to_value(counters)?, None)
                .await
            {
                Ok(_) => return Ok(()),
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryStore;
    use crate::ports::clock::FixedClock;
    use chrono::Utc;
    use serde_json::json;

    fn queue_with(config: QueueConfig) -> Queue {
        Queue::new("q", Arc::new(InMemoryStore::new()), config)
    }

    fn fixed_queue(config: QueueConfig) -> (Queue, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
        let queue = Queue::new("q", store, config).with_clock(clock.clone());
        (queue, clock)
    }

    async fn drain_one(queue: &Queue) -> EntryHandle {
        queue
            .dequeue(Duration::ZERO, &CancelToken::never())
            .await
            .unwrap()
            .expect("entry should be eligible")
    }

    #[tokio::test]
    async fn enqueue_dequeue_complete_round_trip() {
        let queue = queue_with(QueueConfig::default());
        let id = queue.enqueue(json!({"n": 1})).await.unwrap();

        let handle = drain_one(&queue).await;
        assert_eq!(handle.id, id);
        assert_eq!(handle.attempt, 1);
        assert_eq!(handle.payload, json!({"n": 1}));

        queue.complete(&handle).await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.enqueued, 1);
        assert_eq!(stats.dequeued, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.working, 0);
    }

    #[tokio::test]
    async fn dequeue_is_fifo_by_enqueue_order() {
        let queue = queue_with(QueueConfig::default());
        let first = queue.enqueue(json!("a")).await.unwrap();
        let second = queue.enqueue(json!("b")).await.unwrap();
        let third = queue.enqueue(json!("c")).await.unwrap();

        assert_eq!(drain_one(&queue).await.id, first);
        assert_eq!(drain_one(&queue).await.id, second);
        assert_eq!(drain_one(&queue).await.id, third);
    }

    #[tokio::test]
    async fn dequeue_times_out_on_empty_queue() {
        let queue = queue_with(QueueConfig::default());
        let got = queue
            .dequeue(Duration::from_millis(30), &CancelToken::never())
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn dequeue_wakes_on_concurrent_enqueue() {
        let queue = Arc::new(queue_with(QueueConfig::default()));

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                queue
                    .dequeue(Duration::from_secs(5), &CancelToken::never())
                    .await
                    .unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(json!("late")).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .expect("waiter should not panic");
        assert!(got.is_some());
    }

    #[tokio::test]
    async fn dequeue_returns_none_on_cancellation() {
        let queue = Arc::new(queue_with(QueueConfig::default()));
        let source = crate::cancel::CancelSource::new();
        let token = source.token();

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(30), &token).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        source.cancel();

        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("cancel should wake the waiter")
            .expect("waiter should not panic")
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn complete_is_rejected_the_second_time() {
        let queue = queue_with(QueueConfig::default());
        queue.enqueue(json!(1)).await.unwrap();

        let handle = drain_one(&queue).await;
        queue.complete(&handle).await.unwrap();

        let err = queue.complete(&handle).await.unwrap_err();
        assert!(matches!(err, ConveyorError::StaleLease(_)));

        // The double call recorded nothing extra.
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test]
    async fn terminal_entries_never_come_back() {
        let (queue, clock) = fixed_queue(QueueConfig::default().with_max_attempts(0));
        queue.enqueue(json!(1)).await.unwrap();

        // max_attempts = 0: the very first abandon deadletters.
        let handle = drain_one(&queue).await;
        queue.abandon(&handle, Some("boom")).await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.deadlettered, 1);

        // Not even lease expiry resurrects a terminal entry.
        clock.advance(Duration::from_secs(3600));
        let got = queue
            .dequeue(Duration::ZERO, &CancelToken::never())
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn retry_exhaustion_takes_max_plus_one_abandons() {
        let queue = queue_with(
            QueueConfig::default()
                .with_max_attempts(3)
                .with_retry_delay(Duration::ZERO),
        );
        queue.enqueue(json!("always fails")).await.unwrap();

        let mut abandons = 0;
        while let Some(handle) = queue
            .dequeue(Duration::ZERO, &CancelToken::never())
            .await
            .unwrap()
        {
            queue.abandon(&handle, Some("nope")).await.unwrap();
            abandons += 1;
            assert!(abandons <= 10, "entry must reach deadletter");
        }

        assert_eq!(abandons, 4); // m + 1

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.abandoned, 4);
        assert_eq!(stats.errors, 4);
        assert_eq!(stats.deadlettered, 1);
        assert_eq!(stats.queued, 0);
    }

    #[tokio::test]
    async fn abandoned_entry_waits_out_retry_delay() {
        let (queue, clock) = fixed_queue(
            QueueConfig::default()
                .with_max_attempts(3)
                .with_retry_delay(Duration::from_secs(10)),
        );
        queue.enqueue(json!(1)).await.unwrap();

        let handle = drain_one(&queue).await;
        queue.abandon(&handle, None).await.unwrap();

        // Not eligible yet.
        let got = queue
            .dequeue(Duration::ZERO, &CancelToken::never())
            .await
            .unwrap();
        assert!(got.is_none());

        clock.advance(Duration::from_secs(10));
        let handle = drain_one(&queue).await;
        assert_eq!(handle.attempt, 2);
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed_with_fresh_attempt() {
        let (queue, clock) =
            fixed_queue(QueueConfig::default().with_lease_duration(Duration::from_secs(30)));
        queue.enqueue(json!(1)).await.unwrap();

        let first = drain_one(&queue).await;
        assert_eq!(first.attempt, 1);

        // Still leased: invisible to other dequeuers.
        let got = queue
            .dequeue(Duration::ZERO, &CancelToken::never())
            .await
            .unwrap();
        assert!(got.is_none());

        clock.advance(Duration::from_secs(31));
        let second = drain_one(&queue).await;
        assert_eq!(second.id, first.id);
        assert_eq!(second.attempt, 2);

        // The superseded holder's result is rejected both ways.
        assert!(matches!(
            queue.complete(&first).await.unwrap_err(),
            ConveyorError::StaleLease(_)
        ));
        assert!(matches!(
            queue.abandon(&first, None).await.unwrap_err(),
            ConveyorError::StaleLease(_)
        ));

        // The live holder is unaffected.
        queue.complete(&second).await.unwrap();
    }

    #[tokio::test]
    async fn conservation_law_holds_at_quiescence() {
        let queue = queue_with(QueueConfig::default().with_max_attempts(0));
        for n in 0..6 {
            queue.enqueue(json!(n)).await.unwrap();
        }

        // Complete two, deadletter one, leave the rest queued.
        for _ in 0..2 {
            let handle = drain_one(&queue).await;
            queue.complete(&handle).await.unwrap();
        }
        let handle = drain_one(&queue).await;
        queue.abandon(&handle, Some("bad")).await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.working, 0);
        assert_eq!(
            stats.enqueued,
            stats.completed + stats.deadlettered + stats.queued
        );
    }

    #[tokio::test]
    async fn purge_discards_entries_and_counters() {
        let queue = queue_with(QueueConfig::default());
        queue.enqueue(json!(1)).await.unwrap();
        queue.enqueue(json!(2)).await.unwrap();

        queue.purge().await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats, QueueStats::default());
        let got = queue
            .dequeue(Duration::ZERO, &CancelToken::never())
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn contending_dequeuers_never_share_an_entry() {
        let store = Arc::new(InMemoryStore::new());
        let config = QueueConfig::default();
        // Two queue instances over one store, as in separate processes.
        let a = Queue::new("q", store.clone(), config);
        let b = Queue::new("q", store.clone(), config);

        for n in 0..10 {
            a.enqueue(json!(n)).await.unwrap();
        }

        let mut seen = std::collections::HashSet::new();
        let token_a = CancelToken::never();
        let token_b = CancelToken::never();
        loop {
            let (ga, gb) = tokio::join!(
                a.dequeue(Duration::ZERO, &token_a),
                b.dequeue(Duration::ZERO, &token_b),
            );
            let ga = ga.unwrap();
            let gb = gb.unwrap();
            if ga.is_none() && gb.is_none() {
                break;
            }
            for handle in [ga, gb].into_iter().flatten() {
                assert!(seen.insert(handle.id), "entry granted twice: {}", handle.id);
            }
        }
        assert_eq!(seen.len(), 10);
    }
}
