//! Queue lifecycle observation.
//!
//! Observers are strictly read-only taps on the pipeline. Fan-out goes
//! through a bounded channel drained by a background task, so a slow
//! observer can never stall the enqueue/dequeue critical path; when the
//! channel is full the event is dropped and logged, never blocked on.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::domain::EntryId;

/// One queue lifecycle transition.
///
/// Abandon and deadletter carry the attempt count at the time of the call.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueEvent {
    Enqueued {
        id: EntryId,
        at: DateTime<Utc>,
    },
    Dequeued {
        id: EntryId,
        at: DateTime<Utc>,
        attempt: u32,
    },
    Completed {
        id: EntryId,
        at: DateTime<Utc>,
    },
    Abandoned {
        id: EntryId,
        at: DateTime<Utc>,
        attempts: u32,
    },
    Deadlettered {
        id: EntryId,
        at: DateTime<Utc>,
        attempts: u32,
    },
}

/// Callbacks for queue lifecycle events. All methods default to no-ops, so
/// an observer implements only what it cares about.
///
/// A deadlettering abandon produces both `on_abandoned` and
/// `on_deadlettered`, mirroring the stats counters.
#[async_trait]
pub trait QueueObserver: Send + Sync {
    async fn on_enqueued(&self, _id: EntryId, _at: DateTime<Utc>) {}
    async fn on_dequeued(&self, _id: EntryId, _at: DateTime<Utc>, _attempt: u32) {}
    async fn on_completed(&self, _id: EntryId, _at: DateTime<Utc>) {}
    async fn on_abandoned(&self, _id: EntryId, _at: DateTime<Utc>, _attempts: u32) {}
    async fn on_deadlettered(&self, _id: EntryId, _at: DateTime<Utc>, _attempts: u32) {}
}

const EVENT_BUFFER: usize = 256;

/// Bounded fan-out channel between the queue and its observers.
///
/// Dropping the bus closes the channel; the dispatch task drains what is
/// buffered and exits.
pub struct EventBus {
    tx: mpsc::Sender<QueueEvent>,
    _dispatcher: JoinHandle<()>,
}

impl EventBus {
    /// Must be called from within a tokio runtime (spawns the dispatcher).
    pub fn start(observers: Vec<Arc<dyn QueueObserver>>) -> Self {
        let (tx, mut rx) = mpsc::channel::<QueueEvent>(EVENT_BUFFER);

        let dispatcher = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                for observer in &observers {
                    let observer = Arc::clone(observer);
                    let event = event.clone();
                    // Each call runs in its own task: a panicking observer
                    // must not take the dispatcher down with it.
                    let call = tokio::spawn(async move {
                        dispatch(observer.as_ref(), &event).await;
                    });
                    if let Err(err) = call.await {
                        warn!(error = %err, "queue observer panicked");
                    }
                }
            }
        });

        Self {
            tx,
            _dispatcher: dispatcher,
        }
    }

    /// Fire-and-forget publish. Overflow drops the event: observation must
    /// never apply backpressure to the pipeline.
    pub fn publish(&self, event: QueueEvent) {
        if let Err(err) = self.tx.try_send(event) {
            warn!(error = %err, "queue event dropped");
        }
    }
}

async fn dispatch(observer: &dyn QueueObserver, event: &QueueEvent) {
    match *event {
        QueueEvent::Enqueued { id, at } => observer.on_enqueued(id, at).await,
        QueueEvent::Dequeued { id, at, attempt } => observer.on_dequeued(id, at, attempt).await,
        QueueEvent::Completed { id, at } => observer.on_completed(id, at).await,
        QueueEvent::Abandoned { id, at, attempts } => observer.on_abandoned(id, at, attempts).await,
        QueueEvent::Deadlettered { id, at, attempts } => {
            observer.on_deadlettered(id, at, attempts).await
        }
    }
}

/// Observer that counts events, usable as a minimal metrics bridge.
#[derive(Debug, Default)]
pub struct CountingObserver {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    completed: AtomicU64,
    abandoned: AtomicU64,
    deadlettered: AtomicU64,
}

impl CountingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::SeqCst)
    }

    pub fn dequeued(&self) -> u64 {
        self.dequeued.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn abandoned(&self) -> u64 {
        self.abandoned.load(Ordering::SeqCst)
    }

    pub fn deadlettered(&self) -> u64 {
        self.deadlettered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueueObserver for CountingObserver {
    async fn on_enqueued(&self, _id: EntryId, _at: DateTime<Utc>) {
        self.enqueued.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_dequeued(&self, _id: EntryId, _at: DateTime<Utc>, _attempt: u32) {
        self.dequeued.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_completed(&self, _id: EntryId, _at: DateTime<Utc>) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_abandoned(&self, _id: EntryId, _at: DateTime<Utc>, _attempts: u32) {
        self.abandoned.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_deadlettered(&self, _id: EntryId, _at: DateTime<Utc>, _attempts: u32) {
        self.deadlettered.fetch_add(1, Ordering::SeqCst);
    }
}
