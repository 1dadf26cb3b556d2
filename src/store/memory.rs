//! In-process counter store.
//!
//! Each counter lives in a `DashMap` entry; updates go through the entry API,
//! which holds the shard's write lock for the duration of the read-modify-write.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

use super::{Admission, CounterKey, WindowCounterStore};
use crate::clock::Clock;
use crate::error::StoreError;

#[derive(Debug, Clone, Copy)]
struct Slot {
    count: u64,
    expires_at: u64,
}

/// Authoritative counter store for a single process.
#[derive(Debug)]
pub struct MemoryCounterStore {
    slots: DashMap<CounterKey, Slot>,
    clock: Arc<dyn Clock>,
    grace_ms: u64,
}

impl MemoryCounterStore {
    /// Create a store whose counters live until `reset + grace_ms`.
    pub fn new(clock: Arc<dyn Clock>, grace_ms: u64) -> Self {
        Self {
            slots: DashMap::new(),
            clock,
            grace_ms,
        }
    }

    /// Number of counters currently held, expired or not.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Apply `update` to the live count for `key` under the entry lock.
    fn update<T>(&self, key: &CounterKey, reset_at: u64, update: impl FnOnce(&mut u64) -> T) -> T {
        let now = self.clock.now_ms();
        let expires_at = reset_at.saturating_add(self.grace_ms);

        let mut slot = self.slots.entry(key.clone()).or_insert(Slot {
            count: 0,
            expires_at,
        });
        if slot.expires_at < now {
            slot.count = 0;
            slot.expires_at = expires_at;
        }

        update(&mut slot.count)
    }

    pub fn increment_sync(&self, key: &CounterKey, reset_at: u64, cost: u64) -> u64 {
        self.update(key, reset_at, |count| {
            *count = count.saturating_add(cost);
            trace!(key = %key, count = *count, "Incremented counter");
            *count
        })
    }

    pub fn admit_sync(&self, key: &CounterKey, reset_at: u64, cost: u64, limit: u64) -> Admission {
        self.update(key, reset_at, |count| {
            let admission = Admission::evaluate(*count, cost, limit);
            if admission.admitted {
                *count = admission.current;
            }
            admission
        })
    }

    pub fn get_sync(&self, key: &CounterKey) -> u64 {
        let now = self.clock.now_ms();
        self.slots
            .get(key)
            .filter(|slot| slot.expires_at >= now)
            .map(|slot| slot.count)
            .unwrap_or(0)
    }

    pub fn purge_expired_sync(&self) -> usize {
        let now = self.clock.now_ms();
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.expires_at >= now);
        before.saturating_sub(self.slots.len())
    }
}

#[async_trait]
impl WindowCounterStore for MemoryCounterStore {
    async fn increment(
        &self,
        key: &CounterKey,
        reset_at: u64,
        cost: u64,
    ) -> Result<u64, StoreError> {
        Ok(self.increment_sync(key, reset_at, cost))
    }

    async fn admit(
        &self,
        key: &CounterKey,
        reset_at: u64,
        cost: u64,
        limit: u64,
    ) -> Result<Admission, StoreError> {
        Ok(self.admit_sync(key, reset_at, cost, limit))
    }

    async fn get(&self, key: &CounterKey) -> Result<u64, StoreError> {
        Ok(self.get_sync(key))
    }

    async fn purge_expired(&self) -> usize {
        self.purge_expired_sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store_at(now: u64, grace: u64) -> (Arc<ManualClock>, MemoryCounterStore) {
        let clock = Arc::new(ManualClock::new(now));
        let store = MemoryCounterStore::new(clock.clone(), grace);
        (clock, store)
    }

    #[test]
    fn test_increment_accumulates() {
        let (_, store) = store_at(0, 0);
        let key = CounterKey::new("ws:ns", "id", 0);

        assert_eq!(store.increment_sync(&key, 1_000, 1), 1);
        assert_eq!(store.increment_sync(&key, 1_000, 4), 5);
        assert_eq!(store.get_sync(&key), 5);
    }

    #[test]
    fn test_admit_is_all_or_nothing() {
        let (_, store) = store_at(0, 0);
        let key = CounterKey::new("ws:ns", "id", 0);

        assert!(store.admit_sync(&key, 1_000, 8, 10).admitted);

        let rejected = store.admit_sync(&key, 1_000, 5, 10);
        assert!(!rejected.admitted);
        assert_eq!(rejected.current, 13);
        assert_eq!(store.get_sync(&key), 8);

        let admitted = store.admit_sync(&key, 1_000, 2, 10);
        assert_eq!(admitted, Admission { current: 10, admitted: true });
    }

    #[test]
    fn test_expired_counter_reads_as_zero_and_restarts() {
        let (clock, store) = store_at(0, 100);
        let key = CounterKey::new("ws:ns", "id", 0);
        store.increment_sync(&key, 1_000, 3);

        clock.set(1_100);
        assert_eq!(store.get_sync(&key), 3);

        clock.set(1_101);
        assert_eq!(store.get_sync(&key), 0);
        assert_eq!(store.increment_sync(&key, 1_000, 1), 1);
    }

    #[test]
    fn test_purge_expired() {
        let (clock, store) = store_at(0, 0);
        store.increment_sync(&CounterKey::new("ws:ns", "a", 0), 1_000, 1);
        store.increment_sync(&CounterKey::new("ws:ns", "b", 0), 5_000, 1);

        clock.set(2_000);
        assert_eq!(store.purge_expired_sync(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_admissions_never_exceed_limit() {
        let (_, store) = store_at(0, 0);
        let store = Arc::new(store);
        let key = CounterKey::new("ws:ns", "hot", 0);

        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let store = store.clone();
                let key = key.clone();
                tokio::spawn(async move { store.admit(&key, 1_000, 1, 20).await.unwrap() })
            })
            .collect();

        let admitted = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|r| r.as_ref().unwrap().admitted)
            .count();

        assert_eq!(admitted, 20);
        assert_eq!(store.get_sync(&key), 20);
    }
}
