//! Backing store port: keyed, versioned records with CAS and TTL.
//!
//! Design intent:
//! - This is the only coordination primitive the core relies on. Queue and
//!   lock provider both persist their state here, so any store with atomic
//!   compare-and-swap (in-memory, replicated cache, broker-backed) can host
//!   a cross-process deployment.
//! - Versions are opaque monotonic tickets. A record's version changes on
//!   every write, so a successful version-checked mutation proves no other
//!   writer got in between.
//! - Expiry is the store's job: an expired record is invisible, exactly as
//!   if it had been removed. Lock liveness leans on this.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

/// A stored value together with its version ticket and optional expiry.
#[derive(Debug, Clone)]
pub struct VersionedRecord {
    pub value: Value,
    pub version: u64,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// A version-checked mutation lost the race.
    #[error("version conflict on key {key}: expected {expected:?}, found {found:?}")]
    VersionConflict {
        key: String,
        expected: Option<u64>,
        found: Option<u64>,
    },

    /// Connectivity or backend-side failure. Fatal for the operation; the
    /// core never retries these implicitly.
    #[error("store backend failure: {0}")]
    Backend(String),
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetch a record. Expired records read as absent.
    async fn get(&self, key: &str) -> Result<Option<VersionedRecord>, StoreError>;

    /// Unconditional write. Returns the new version.
    async fn put(
        &self,
        key: &str,
        value: Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<u64, StoreError>;

    /// Atomic conditional write. Returns the new version.
    ///
    /// - `expected = None`: insert; the key must be absent (or expired).
    /// - `expected = Some(v)`: update; the current version must equal `v`.
    ///
    /// A mismatch yields [`StoreError::VersionConflict`].
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<u64, StoreError>;

    /// Remove unconditionally. Removing an absent key is a no-op.
    async fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Remove only if the current version matches. Returns whether a
    /// record was removed.
    async fn remove_if(&self, key: &str, expected: u64) -> Result<bool, StoreError>;

    /// All live records whose key starts with `prefix`, sorted by key
    /// ascending.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, VersionedRecord)>, StoreError>;
}
