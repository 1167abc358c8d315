//! In-memory backing store.
//!
//! Reference implementation of the store port, for tests and
//! single-process deployments. Versions come from one global counter, so a
//! key that is removed and re-inserted never reuses a version and
//! `remove_if` cannot be fooled by re-insertion.
//!
//! Expiry is lazy: expired records are dropped when a read or write next
//! touches their key, which is enough to make them unobservable.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::ports::clock::{Clock, SystemClock};
use crate::ports::store::{KeyValueStore, StoreError, VersionedRecord};

struct MemoryState {
    records: BTreeMap<String, VersionedRecord>,
    next_version: u64,
}

impl MemoryState {
    fn purge_if_expired(&mut self, key: &str, now: DateTime<Utc>) {
        let expired = self
            .records
            .get(key)
            .is_some_and(|rec| rec.expires_at.is_some_and(|t| t <= now));
        if expired {
            self.records.remove(key);
        }
    }

    fn next_version(&mut self) -> u64 {
        let version = self.next_version;
        self.next_version += 1;
        version
    }
}

pub struct InMemoryStore {
    state: Mutex<MemoryState>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                records: BTreeMap::new(),
                next_version: 1,
            }),
            clock,
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<VersionedRecord>, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.purge_if_expired(key, now);
        Ok(state.records.get(key).cloned())
    }

    async fn put(
        &self,
        key: &str,
        value: Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let version = state.next_version();
        state.records.insert(
            key.to_string(),
            VersionedRecord {
                value,
                version,
                expires_at,
            },
        );
        Ok(version)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.purge_if_expired(key, now);

        let found = state.records.get(key).map(|rec| rec.version);
        if found != expected {
            return Err(StoreError::VersionConflict {
                key: key.to_string(),
                expected,
                found,
            });
        }

        let version = state.next_version();
        state.records.insert(
            key.to_string(),
            VersionedRecord {
                value,
                version,
                expires_at,
            },
        );
        Ok(version)
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.records.remove(key);
        Ok(())
    }

    async fn remove_if(&self, key: &str, expected: u64) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.purge_if_expired(key, now);

        if state.records.get(key).is_some_and(|rec| rec.version == expected) {
            state.records.remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn scan_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, VersionedRecord)>, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let expired: Vec<String> = state
            .records
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter(|(_, rec)| rec.expires_at.is_some_and(|t| t <= now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            state.records.remove(&key);
        }

        // BTreeMap iteration is already key-ascending.
        Ok(state
            .records
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, rec)| (key.clone(), rec.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::clock::FixedClock;
    use chrono::TimeDelta;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn cas_insert_update_conflict() {
        let store = InMemoryStore::new();

        let v1 = store
            .compare_and_swap("k", None, json!(1), None)
            .await
            .unwrap();

        // A second insert must lose.
        let err = store
            .compare_and_swap("k", None, json!(2), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));

        // Update with the right version wins and bumps the version.
        let v2 = store
            .compare_and_swap("k", Some(v1), json!(2), None)
            .await
            .unwrap();
        assert!(v2 > v1);

        // The loser's stale version no longer works.
        let err = store
            .compare_and_swap("k", Some(v1), json!(3), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn expired_records_read_as_absent() {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let store = InMemoryStore::with_clock(clock.clone());

        let expires = clock.now() + TimeDelta::seconds(10);
        store.put("k", json!("v"), Some(expires)).await.unwrap();
        assert!(store.get("k").await.unwrap().is_some());

        clock.advance(Duration::from_secs(11));
        assert!(store.get("k").await.unwrap().is_none());

        // The slot is free again: insert-if-absent succeeds.
        store
            .compare_and_swap("k", None, json!("v2"), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn remove_if_checks_version() {
        let store = InMemoryStore::new();
        let v1 = store.put("k", json!(1), None).await.unwrap();

        assert!(!store.remove_if("k", v1 + 999).await.unwrap());
        assert!(store.get("k").await.unwrap().is_some());

        assert!(store.remove_if("k", v1).await.unwrap());
        assert!(store.get("k").await.unwrap().is_none());

        // Idempotent on an absent key.
        assert!(!store.remove_if("k", v1).await.unwrap());
    }

    #[tokio::test]
    async fn scan_prefix_is_sorted_and_filtered() {
        let store = InMemoryStore::new();
        store.put("q/entry/b", json!(2), None).await.unwrap();
        store.put("q/entry/a", json!(1), None).await.unwrap();
        store.put("q/stats", json!(0), None).await.unwrap();
        store.put("other", json!(9), None).await.unwrap();

        let hits = store.scan_prefix("q/entry/").await.unwrap();
        let keys: Vec<_> = hits.iter().map(|(key, _)| key.as_str()).collect();
        assert_eq!(keys, vec!["q/entry/a", "q/entry/b"]);
    }
}
