//! Queue statistics.

use serde::{Deserialize, Serialize};

/// Lifetime event counters, persisted alongside the entries.
///
/// Updated incrementally (CAS loop on a single record) rather than
/// recomputed, because abandon events are not recoverable from the entry
/// population alone once an entry is re-leased.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifetimeCounters {
    /// Entries ever enqueued.
    pub enqueued: u64,
    /// Lease grants ever made (includes reclamations).
    pub dequeued: u64,
    /// Entries completed.
    pub completed: u64,
    /// Abandon calls, including the final one that deadletters.
    pub abandoned: u64,
    /// Abandon calls that carried an error reason.
    pub errors: u64,
    /// Entries deadlettered.
    pub deadlettered: u64,
}

/// Point-in-time queue snapshot.
///
/// `queued` and `working` are derived from the entry population at read
/// time; the rest come from [`LifetimeCounters`]. At quiescence (no live
/// leases) the population obeys
/// `enqueued == completed + deadlettered + queued`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Entries currently eligible or waiting out a retry delay.
    pub queued: u64,
    /// Entries currently under a live lease.
    pub working: u64,
    pub enqueued: u64,
    pub dequeued: u64,
    pub completed: u64,
    pub abandoned: u64,
    pub errors: u64,
    pub deadlettered: u64,
}

impl QueueStats {
    pub(crate) fn from_parts(counters: LifetimeCounters, queued: u64, working: u64) -> Self {
        Self {
            queued,
            working,
            enqueued: counters.enqueued,
            dequeued: counters.dequeued,
            completed: counters.completed,
            abandoned: counters.abandoned,
            errors: counters.errors,
            deadlettered: counters.deadlettered,
        }
    }
}
