//! Entry record: persisted state + the handle dequeuers see.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::EntryState;
use crate::domain::{EntryId, LeaseToken};

/// Persisted form of one queue entry.
///
/// Design:
/// - This is the single source of truth for entry state; it lives in the
///   backing store and every transition is a compare-and-swap on it.
/// - Dequeuers never see this struct. They get an [`EntryHandle`] and must
///   call back into the queue to mutate state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryRecord {
    pub id: EntryId,
    pub payload: Value,
    pub state: EntryState,

    /// Number of lease grants so far (incremented on every dequeue,
    /// including reclamation of an expired lease).
    pub attempts: u32,

    /// Proof of the current lease, while `Leased`.
    pub lease_token: Option<LeaseToken>,

    /// Most recent abandon reason, if any.
    pub last_error: Option<String>,

    pub enqueued_at: DateTime<Utc>,

    /// Lease window end, while `Leased`. Expiry makes the entry eligible
    /// again without any caller action.
    pub lease_expires_at: Option<DateTime<Utc>>,

    /// Earliest re-eligibility, while `Abandoned` (retry delay).
    pub not_before: Option<DateTime<Utc>>,

    pub updated_at: DateTime<Utc>,
}

impl EntryRecord {
    pub fn new(id: EntryId, payload: Value, now: DateTime<Utc>) -> Self {
        Self {
            id,
            payload,
            state: EntryState::Queued,
            attempts: 0,
            lease_token: None,
            last_error: None,
            enqueued_at: now,
            lease_expires_at: None,
            not_before: None,
            updated_at: now,
        }
    }

    /// Is this entry grantable to a dequeuer at `now`?
    ///
    /// Three ways in: plain `Queued`, `Abandoned` past its retry delay, and
    /// `Leased` past its lease window (automatic reclamation of work whose
    /// holder crashed or stalled).
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            EntryState::Queued => true,
            EntryState::Abandoned => self.not_before.is_none_or(|t| t <= now),
            EntryState::Leased => self.lease_expires_at.is_some_and(|t| t <= now),
            EntryState::Completed | EntryState::Deadlettered => false,
        }
    }

    /// Does `token` prove a currently-valid lease on this entry?
    ///
    /// An expired lease no longer counts, even if nobody reclaimed the entry
    /// yet: the grant has lapsed and the result may race a reclaimer.
    pub fn holds_lease(&self, token: LeaseToken, now: DateTime<Utc>) -> bool {
        self.state == EntryState::Leased
            && self.lease_token == Some(token)
            && self.lease_expires_at.is_some_and(|t| t > now)
    }

    /// Grant a lease (increments `attempts`).
    pub fn begin_lease(&mut self, token: LeaseToken, now: DateTime<Utc>, until: DateTime<Utc>) {
        self.state = EntryState::Leased;
        self.attempts += 1;
        self.lease_token = Some(token);
        self.lease_expires_at = Some(until);
        self.not_before = None;
        self.updated_at = now;
    }

    /// Mark as completed (terminal).
    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.state = EntryState::Completed;
        self.lease_token = None;
        self.lease_expires_at = None;
        self.updated_at = now;
    }

    /// Park as abandoned, eligible again at `not_before`.
    pub fn mark_abandoned(
        &mut self,
        now: DateTime<Utc>,
        not_before: DateTime<Utc>,
        reason: Option<String>,
    ) {
        self.state = EntryState::Abandoned;
        self.lease_token = None;
        self.lease_expires_at = None;
        self.not_before = Some(not_before);
        if reason.is_some() {
            self.last_error = reason;
        }
        self.updated_at = now;
    }

    /// Park permanently (terminal).
    pub fn mark_deadlettered(&mut self, now: DateTime<Utc>, reason: Option<String>) {
        self.state = EntryState::Deadlettered;
        self.lease_token = None;
        self.lease_expires_at = None;
        self.not_before = None;
        if reason.is_some() {
            self.last_error = reason;
        }
        self.updated_at = now;
    }
}

/// What a dequeuer receives: enough to run the work and report back, and
/// nothing it could use to mutate the entry directly.
#[derive(Debug, Clone)]
pub struct EntryHandle {
    pub id: EntryId,
    pub payload: Value,
    /// The attempt number this lease represents (1 for the first dequeue).
    pub attempt: u32,
    pub lease_token: LeaseToken,
}
