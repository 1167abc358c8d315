//! Strongly-typed identifiers.
//!
//! IDs are ULIDs (Universally Unique Lexicographically Sortable Identifiers)
//! wrapped in a phantom-typed `Id<T>` so that an `EntryId` and a `LockToken`
//! can never be mixed up at compile time.
//!
//! ULID properties the queue relies on:
//! - **Sortable by creation time**: the timestamp is the high-order component,
//!   so scanning entry keys in lexicographic order yields FIFO-by-enqueue-time.
//! - **Coordination-free generation**: any worker can mint one without a
//!   central allocator.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// Marker trait for each ID flavor.
///
/// Provides the `Display` prefix (e.g. "entry-", "lease-").
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic ID type.
///
/// `T` is a zero-sized marker; it costs nothing at runtime but keeps the
/// different ID spaces apart at compile time.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    /// Mint a fresh ID.
    pub fn generate() -> Self {
        Self::from_ulid(Ulid::new())
    }

    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Marker type for queue entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Entry {}

impl IdMarker for Entry {
    fn prefix() -> &'static str {
        "entry-"
    }
}

/// Marker type for dequeue leases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Lease {}

impl IdMarker for Lease {
    fn prefix() -> &'static str {
        "lease-"
    }
}

/// Marker type for lock ownership tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Lock {}

impl IdMarker for Lock {
    fn prefix() -> &'static str {
        "lock-"
    }
}

/// Identifier of a queue entry, assigned at enqueue.
pub type EntryId = Id<Entry>;

/// Proof of a dequeue lease; required by complete/abandon.
pub type LeaseToken = Id<Lease>;

/// Proof of lock ownership; required by release/renew.
pub type LockToken = Id<Lock>;
