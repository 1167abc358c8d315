//! conveyor-core
//!
//! Durable job processing over a pluggable key-value store.
//!
//! # Module map
//! - **domain**: identifiers and job results
//! - **ports**: abstraction seams (`KeyValueStore`, `Clock`)
//! - **impls**: reference implementations of the ports
//! - **queue**: the entry state machine (enqueue, lease, settle, stats)
//! - **lock**: distributed mutual exclusion and throttling
//! - **job** / **runner** / **worker**: executing application work
//! - **observer**: read-only lifecycle taps
//! - **cancel**: cooperative cancellation plumbing
//!
//! Everything coordinates through the store: two processes pointed at the
//! same backend share queues and locks with no other channel between them.

pub mod cancel;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod job;
pub mod lock;
pub mod observer;
pub mod ports;
pub mod queue;
pub mod runner;
pub mod worker;

pub use cancel::{CancelSource, CancelToken};
pub use config::{QueueConfig, ThrottleConfig};
pub use domain::{EntryId, JobResult, LeaseToken, LockToken};
pub use error::ConveyorError;
pub use impls::InMemoryStore;
pub use job::{job_fn, Job, JobContext};
pub use lock::{Lock, LockProvider, StoreLockProvider, ThrottlingLockProvider};
pub use observer::{CountingObserver, EventBus, QueueEvent, QueueObserver};
pub use ports::{Clock, KeyValueStore, StoreError, SystemClock, VersionedRecord};
pub use queue::{
    EntryHandle, EntryRecord, EntryState, Queue, QueueStats, RetryPolicy,
};
pub use runner::{JobRunner, LockSettings, RunOutcome};
pub use worker::RunnerGroup;
