use thiserror::Error;

use crate::domain::EntryId;
use crate::ports::store::StoreError;

#[derive(Debug, Error)]
pub enum ConveyorError {
    #[error("entry not found: {0}")]
    EntryNotFound(EntryId),

    /// The entry is no longer leased under the caller's handle: the lease
    /// expired, another dequeuer reclaimed it, or it already reached a
    /// terminal state. A double-processing signal; the caller must not
    /// assume its result was recorded.
    #[error("stale lease for {0}")]
    StaleLease(EntryId),

    #[error("lock on {0} lost or expired")]
    LockLost(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("codec failure: {0}")]
    Codec(#[from] serde_json::Error),
}
