use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::ConsistencyStrategy;
use crate::clock::Clock;
use crate::error::StoreError;
use crate::ratelimit::window::Window;
use crate::store::{Admission, CounterKey, WindowCounterStore};

/// Tuning for the fast strategy's background propagation.
#[derive(Debug, Clone)]
pub struct FastSettings {
    /// How often pending increments are flushed to the shared store
    pub flush_interval: Duration,
    /// Flush early once this many keys have pending increments
    pub max_batch_size: usize,
    /// Upper bound on the final flush during shutdown
    pub shutdown_timeout: Duration,
    /// How long local views outlive their window
    pub grace_ms: u64,
}

impl Default for FastSettings {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(250),
            max_batch_size: 512,
            shutdown_timeout: Duration::from_secs(2),
            grace_ms: 60_000,
        }
    }
}

/// Node-local view of one counter.
#[derive(Debug, Clone, Copy)]
struct LocalCount {
    /// Shared total as of the last flush or refresh
    synced: u64,
    /// Admitted here and not yet flushed
    unsynced: u64,
    reset_at: u64,
}

#[derive(Debug)]
struct Increment {
    key: CounterKey,
    reset_at: u64,
    cost: u64,
}

#[derive(Debug, Clone, Copy)]
struct PendingDelta {
    reset_at: u64,
    cost: u64,
}

/// Admits from a local view and propagates increments asynchronously.
pub struct FastStrategy {
    local: Arc<DashMap<CounterKey, LocalCount>>,
    tx: mpsc::UnboundedSender<Increment>,
    cancel: CancellationToken,
    flusher: parking_lot::Mutex<Option<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

impl FastStrategy {
    /// Start the strategy and its flusher task. Must be called within a
    /// Tokio runtime.
    pub fn spawn(
        shared: Arc<dyn WindowCounterStore>,
        clock: Arc<dyn Clock>,
        settings: FastSettings,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let local = Arc::new(DashMap::new());
        let cancel = CancellationToken::new();

        let flusher = Flusher {
            shared,
            local: local.clone(),
            clock,
            settings: settings.clone(),
            batch: HashMap::new(),
        };
        let handle = tokio::spawn(flusher.run(rx, cancel.clone()));

        Self {
            local,
            tx,
            cancel,
            flusher: parking_lot::Mutex::new(Some(handle)),
            shutdown_timeout: settings.shutdown_timeout,
        }
    }

    /// Current local view of a counter.
    pub fn local_view(&self, key: &CounterKey) -> u64 {
        self.local
            .get(key)
            .map(|c| c.synced.saturating_add(c.unsynced))
            .unwrap_or(0)
    }

    /// Stop the flusher after a final best-effort flush.
    ///
    /// Waits at most the configured shutdown timeout; increments still
    /// pending after that are dropped.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let handle = self.flusher.lock().take();
        let Some(mut handle) = handle else {
            return;
        };

        match tokio::time::timeout(self.shutdown_timeout, &mut handle).await {
            Ok(Ok(())) => info!("Fast strategy flushed pending increments"),
            Ok(Err(e)) => warn!(error = %e, "Fast strategy flusher failed"),
            Err(_) => {
                warn!(
                    timeout_ms = self.shutdown_timeout.as_millis() as u64,
                    "Timed out flushing pending increments"
                );
                handle.abort();
            }
        }
    }
}

impl Drop for FastStrategy {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl ConsistencyStrategy for FastStrategy {
    fn name(&self) -> &'static str {
        "fast"
    }

    async fn admit(
        &self,
        key: &CounterKey,
        window: &Window,
        cost: u64,
        limit: u64,
    ) -> Result<Admission, StoreError> {
        let admission = {
            let mut entry = self.local.entry(key.clone()).or_insert(LocalCount {
                synced: 0,
                unsynced: 0,
                reset_at: window.reset(),
            });
            let view = entry.synced.saturating_add(entry.unsynced);
            let admission = Admission::evaluate(view, cost, limit);
            if admission.admitted && cost > 0 {
                entry.unsynced = entry.unsynced.saturating_add(cost);
            }
            admission
        };

        if admission.admitted && cost > 0 {
            let increment = Increment {
                key: key.clone(),
                reset_at: window.reset(),
                cost,
            };
            if self.tx.send(increment).is_err() {
                warn!(key = %key, "Flusher stopped, increment counted locally only");
            }
        }

        trace!(
            key = %key,
            current = admission.current,
            admitted = admission.admitted,
            "Fast admission"
        );
        Ok(admission)
    }
}

/// Background task state: batches increments and syncs local views.
struct Flusher {
    shared: Arc<dyn WindowCounterStore>,
    local: Arc<DashMap<CounterKey, LocalCount>>,
    clock: Arc<dyn Clock>,
    settings: FastSettings,
    batch: HashMap<CounterKey, PendingDelta>,
}

impl Flusher {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Increment>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        debug!(
            flush_interval_ms = self.settings.flush_interval.as_millis() as u64,
            max_batch_size = self.settings.max_batch_size,
            "Fast strategy flusher started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Some(increment) => {
                        self.enqueue(increment);
                        if self.batch.len() >= self.settings.max_batch_size {
                            self.flush().await;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    self.flush().await;
                    self.refresh().await;
                    self.evict_stale();
                }
            }
        }

        while let Ok(increment) = rx.try_recv() {
            self.enqueue(increment);
        }
        self.flush().await;
        debug!("Fast strategy flusher stopped");
    }

    fn enqueue(&mut self, increment: Increment) {
        let pending = self.batch.entry(increment.key).or_insert(PendingDelta {
            reset_at: increment.reset_at,
            cost: 0,
        });
        pending.cost = pending.cost.saturating_add(increment.cost);
    }

    async fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }

        let now = self.clock.now_ms();
        let batch = std::mem::take(&mut self.batch);
        let mut failed = 0usize;
        let mut last_error = None;

        for (key, pending) in batch {
            match self.shared.increment(&key, pending.reset_at, pending.cost).await {
                Ok(total) => {
                    if let Some(mut entry) = self.local.get_mut(&key) {
                        entry.unsynced = entry.unsynced.saturating_sub(pending.cost);
                        entry.synced = total;
                    }
                }
                Err(e) => {
                    failed += 1;
                    // Retry next tick unless the window is already gone. A
                    // delta that may have landed stays in the local view only.
                    let live = now <= pending.reset_at.saturating_add(self.settings.grace_ms);
                    if live && e.is_retryable() {
                        let retained = self.batch.entry(key).or_insert(PendingDelta {
                            reset_at: pending.reset_at,
                            cost: 0,
                        });
                        retained.cost = retained.cost.saturating_add(pending.cost);
                    }
                    last_error = Some(e);
                }
            }
        }

        if let Some(e) = last_error {
            warn!(failed, error = %e, "Failed to flush increments to shared store");
        }
    }

    /// Pull shared totals for keys with nothing pending.
    async fn refresh(&mut self) {
        let now = self.clock.now_ms();
        let idle: Vec<CounterKey> = self
            .local
            .iter()
            .filter(|entry| !self.batch.contains_key(entry.key()) && entry.reset_at > now)
            .map(|entry| entry.key().clone())
            .collect();

        for key in idle {
            match self.shared.get(&key).await {
                Ok(total) => {
                    if let Some(mut entry) = self.local.get_mut(&key) {
                        entry.synced = total;
                    }
                }
                Err(e) => {
                    debug!(key = %key, error = %e, "Failed to refresh shared total");
                    break;
                }
            }
        }
    }

    fn evict_stale(&self) {
        let now = self.clock.now_ms();
        let grace = self.settings.grace_ms;
        self.local
            .retain(|_, count| now <= count.reset_at.saturating_add(grace));
    }
}
