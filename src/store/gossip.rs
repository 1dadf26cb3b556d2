//! Counter store backed by the gossip mesh.
//!
//! Each node owns its contribution to a counter and gossips it; totals are
//! the sum over live nodes. Reads converge within a few gossip intervals, so
//! this store only backs the fast strategy's propagation path.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{Admission, CounterKey, WindowCounterStore};
use crate::clock::Clock;
use crate::error::StoreError;
use crate::mesh::Cluster;

/// Eventually consistent counter store shared through cluster gossip.
#[derive(Debug)]
pub struct GossipCounterStore {
    cluster: Arc<Cluster>,
    clock: Arc<dyn Clock>,
    grace_ms: u64,
    /// Keys this node has written, with their expiry.
    written: DashMap<CounterKey, u64>,
}

impl GossipCounterStore {
    pub fn new(cluster: Arc<Cluster>, clock: Arc<dyn Clock>, grace_ms: u64) -> Self {
        Self {
            cluster,
            clock,
            grace_ms,
            written: DashMap::new(),
        }
    }

    fn track(&self, key: &CounterKey, reset_at: u64) {
        self.written
            .entry(key.clone())
            .or_insert(reset_at.saturating_add(self.grace_ms));
    }

    fn is_live(&self, key: &CounterKey) -> bool {
        let now = self.clock.now_ms();
        self.written
            .get(key)
            .map_or(true, |expires_at| *expires_at >= now)
    }
}

#[async_trait]
impl WindowCounterStore for GossipCounterStore {
    async fn increment(
        &self,
        key: &CounterKey,
        reset_at: u64,
        cost: u64,
    ) -> Result<u64, StoreError> {
        self.track(key, reset_at);
        Ok(self.cluster.increment_counter(&key.to_store_key(), cost).await)
    }

    /// Peers' contributions arrive by gossip, so no node can check a limit
    /// and commit in one step.
    async fn admit(
        &self,
        _key: &CounterKey,
        _reset_at: u64,
        _cost: u64,
        _limit: u64,
    ) -> Result<Admission, StoreError> {
        Err(StoreError::Unsupported(
            "gossip counters cannot admit atomically".to_string(),
        ))
    }

    async fn get(&self, key: &CounterKey) -> Result<u64, StoreError> {
        if !self.is_live(key) {
            return Ok(0);
        }
        Ok(self.cluster.get_count(&key.to_store_key()).await)
    }

    async fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let expired: Vec<CounterKey> = self
            .written
            .iter()
            .filter(|entry| *entry.value() < now)
            .map(|entry| entry.key().clone())
            .collect();

        for key in &expired {
            self.cluster.delete_counter(&key.to_store_key()).await;
            self.written.remove(key);
        }

        expired.len()
    }
}
