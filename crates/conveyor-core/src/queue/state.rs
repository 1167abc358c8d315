//! Entry state machine for the queue.

use serde::{Deserialize, Serialize};

/// Queue entry state.
///
/// State transitions:
/// - Queued -> Leased -> Completed
/// - Queued -> Leased -> Abandoned -> Queued-equivalent (promoted once
///   `not_before` passes, loop until the retry budget runs out)
/// - Queued -> Leased -> Deadlettered (when `attempts` exceeds `max_attempts`)
/// - Leased -> Leased (lease expired, reclaimed by another dequeuer)
///
/// Design note: Using an enum ensures exhaustive matching and prevents
/// invalid states. `Abandoned` is a real persisted state, not a flag: an
/// abandoned entry with retry budget left waits out its delay there and is
/// indistinguishable from `Queued` to dequeuers once the delay passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryState {
    /// Ready to be leased immediately.
    Queued,

    /// Currently leased to one dequeuer, until `lease_expires_at`.
    Leased,

    /// Abandoned with retry budget left; eligible again after `not_before`.
    Abandoned,

    /// Successfully completed.
    Completed,

    /// Retry budget exhausted; parked permanently.
    Deadlettered,
}

impl EntryState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, EntryState::Completed | EntryState::Deadlettered)
    }
}
