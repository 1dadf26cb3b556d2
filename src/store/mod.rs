//! Window counter storage.
//!
//! Counters are keyed by namespace, identifier and window start. Every store
//! must make `increment` and `admit` atomic per key and must ignore counters
//! whose window (plus grace) has closed.

mod gossip;
mod memory;
mod routed;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::StoreError;

pub use gossip::GossipCounterStore;
pub use memory::MemoryCounterStore;
pub use routed::{
    CounterCommand, CounterOp, CounterReply, RoutedCounterStore, CLUSTER_SECRET_HEADER,
    INTERNAL_COUNTERS_PATH,
};

/// Key identifying one window counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CounterKey {
    /// Workspace-qualified namespace scope.
    pub namespace: String,
    /// The limited identifier.
    pub identifier: String,
    /// Window start (epoch milliseconds, floored to the window boundary).
    pub window_start: u64,
}

impl CounterKey {
    pub fn new(namespace: &str, identifier: &str, window_start: u64) -> Self {
        Self {
            namespace: namespace.to_string(),
            identifier: identifier.to_string(),
            window_start,
        }
    }

    /// Flat string form used by gossip state and ownership hashing.
    /// Format: "counter|{ns_len}:{namespace}|{id_len}:{identifier}|{window_start}"
    ///
    /// Lengths are in bytes, so separators inside either part cannot make two
    /// keys collide.
    pub fn to_store_key(&self) -> String {
        format!(
            "counter|{}:{}|{}:{}|{}",
            self.namespace.len(),
            self.namespace,
            self.identifier.len(),
            self.identifier,
            self.window_start
        )
    }
}

impl std::fmt::Display for CounterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_store_key())
    }
}

/// Outcome of an admission attempt against a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Admission {
    /// Count after this attempt: the committed total when admitted, or the
    /// total the attempt would have produced when rejected.
    pub current: u64,
    /// Whether the cost was committed.
    pub admitted: bool,
}

impl Admission {
    /// Evaluate an all-or-nothing attempt of `cost` against `count`.
    pub fn evaluate(count: u64, cost: u64, limit: u64) -> Self {
        let current = count.saturating_add(cost);
        Self {
            current,
            admitted: current <= limit,
        }
    }
}

/// Storage for per-window counters.
#[async_trait]
pub trait WindowCounterStore: Send + Sync {
    /// Add `cost` to the counter unconditionally and return the new total.
    async fn increment(&self, key: &CounterKey, reset_at: u64, cost: u64)
        -> Result<u64, StoreError>;

    /// Commit `cost` only if the total stays within `limit`.
    async fn admit(
        &self,
        key: &CounterKey,
        reset_at: u64,
        cost: u64,
        limit: u64,
    ) -> Result<Admission, StoreError>;

    /// Current total for the counter, zero if absent or expired.
    async fn get(&self, key: &CounterKey) -> Result<u64, StoreError>;

    /// Drop counters whose window and grace period have passed.
    async fn purge_expired(&self) -> usize {
        0
    }
}

/// Spawn a background task that periodically purges expired counters.
pub fn spawn_sweeper(
    store: Arc<dyn WindowCounterStore>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(interval_secs = interval.as_secs(), "Counter sweeper started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Counter sweeper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let removed = store.purge_expired().await;
                    if removed > 0 {
                        debug!(removed, "Purged expired counters");
                    }
                }
            }
        }
    })
}
