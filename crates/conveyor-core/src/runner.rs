//! Drives jobs against a queue.
//!
//! Design intent:
//! - The runner owns the dequeue/execute/settle cycle; the queue owns the
//!   state machine. The runner never mutates entry state directly, it only
//!   calls `complete` or `abandon` with the handle it was given.
//! - Panics in job code are caught at the task boundary and reported as
//!   failures, so one bad entry cannot take a runner down.
//! - When a lock resource is configured, the lock is taken after the
//!   dequeue and a denial puts the entry straight back via `abandon`
//!   without invoking the job. Denied entries burn an attempt; the retry
//!   limit is what stops a permanently throttled entry from circulating
//!   forever.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::domain::{EntryId, JobResult};
use crate::error::ConveyorError;
use crate::job::{Job, JobContext};
use crate::lock::LockProvider;
use crate::queue::{EntryHandle, Queue};

/// Lock a runner takes around each job execution.
pub struct LockSettings {
    pub provider: Arc<dyn LockProvider>,
    pub resource: String,
    pub lease_duration: Duration,
    pub acquire_timeout: Duration,
}

impl LockSettings {
    pub fn new(provider: Arc<dyn LockProvider>, resource: impl Into<String>) -> Self {
        Self {
            provider,
            resource: resource.into(),
            lease_duration: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    pub fn with_acquire_timeout(mut self, acquire_timeout: Duration) -> Self {
        self.acquire_timeout = acquire_timeout;
        self
    }
}

/// What one dequeue/execute/settle cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Nothing eligible within the dequeue timeout.
    Empty,
    Completed(EntryId),
    /// Abandoned, whether back onto the queue or into the dead letter set.
    Abandoned(EntryId),
    Cancelled,
}

pub struct JobRunner {
    queue: Arc<Queue>,
    job: Arc<dyn Job>,
    lock: Option<LockSettings>,
    dequeue_timeout: Duration,
}

impl JobRunner {
    pub fn new(queue: Arc<Queue>, job: Arc<dyn Job>) -> Self {
        Self {
            queue,
            job,
            lock: None,
            dequeue_timeout: Duration::from_secs(1),
        }
    }

    pub fn with_lock(mut self, lock: LockSettings) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn with_dequeue_timeout(mut self, dequeue_timeout: Duration) -> Self {
        self.dequeue_timeout = dequeue_timeout;
        self
    }

    /// One cycle: dequeue, execute, settle.
    pub async fn run_once(&self, cancel: &CancelToken) -> Result<RunOutcome, ConveyorError> {
        if cancel.is_cancelled() {
            return Ok(RunOutcome::Cancelled);
        }

        let Some(handle) = self.queue.dequeue(self.dequeue_timeout, cancel).await? else {
            if cancel.is_cancelled() {
                return Ok(RunOutcome::Cancelled);
            }
            return Ok(RunOutcome::Empty);
        };

        let held = match &self.lock {
            Some(settings) => {
                let granted = settings
                    .provider
                    .acquire(
                        &settings.resource,
                        settings.lease_duration,
                        settings.acquire_timeout,
                        cancel,
                    )
                    .await?;
                match granted {
                    Some(lock) => Some((lock, settings)),
                    None => {
                        // Back onto the queue without running the job; not
                        // an error, so no reason is recorded.
                        debug!(id = %handle.id, resource = %settings.resource,
                            "lock denied, requeueing");
                        self.queue.abandon(&handle, None).await?;
                        return Ok(RunOutcome::Abandoned(handle.id));
                    }
                }
            }
            None => None,
        };

        let result = self.execute(&handle, cancel).await;

        let outcome = match &result {
            JobResult::Success => {
                self.queue.complete(&handle).await?;
                RunOutcome::Completed(handle.id)
            }
            JobResult::Failed { reason } => {
                self.queue.abandon(&handle, Some(reason.as_str())).await?;
                RunOutcome::Abandoned(handle.id)
            }
            JobResult::Cancelled => {
                self.queue.abandon(&handle, None).await?;
                RunOutcome::Abandoned(handle.id)
            }
        };

        if let Some((lock, settings)) = held {
            // Entry state is already settled; a failed release only costs
            // the lock its remaining TTL.
            if let Err(err) = settings.provider.release(&lock).await {
                warn!(resource = %settings.resource, error = %err, "lock release failed");
            }
        }

        Ok(outcome)
    }

    /// Run until the queue stays empty for two consecutive cycles.
    ///
    /// Entries that turn up mid-drain are processed too; the double empty
    /// read is what distinguishes "drained" from "momentarily between
    /// entries". A stale lease mid-settle means another runner reclaimed
    /// the entry, which is contention, not failure.
    pub async fn run_until_empty(&self, cancel: &CancelToken) -> Result<(), ConveyorError> {
        let mut empty_streak = 0;
        loop {
            match self.run_once(cancel).await {
                Ok(RunOutcome::Empty) => {
                    empty_streak += 1;
                    if empty_streak >= 2 {
                        return Ok(());
                    }
                }
                Ok(RunOutcome::Cancelled) => return Ok(()),
                Ok(_) => empty_streak = 0,
                Err(ConveyorError::StaleLease(id)) => {
                    warn!(%id, "lease lost mid-settle, entry reclaimed elsewhere");
                    empty_streak = 0;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn execute(&self, handle: &EntryHandle, cancel: &CancelToken) -> JobResult {
        let ctx = JobContext {
            entry_id: handle.id,
            payload: handle.payload.clone(),
            attempt: handle.attempt,
            cancel: cancel.clone(),
        };

        let job = Arc::clone(&self.job);
        // Run on a separate task so a panic unwinds there, not here.
        let run = tokio::spawn(async move { job.run(ctx).await });
        match run.await {
            Ok(result) => result,
            Err(err) if err.is_panic() => {
                warn!(id = %handle.id, "job panicked");
                JobResult::failed("job panicked")
            }
            Err(_) => JobResult::cancelled(),
        }
    }
}
