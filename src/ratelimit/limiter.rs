//! The rate limiter façade.
//!
//! A decision runs in two steps: resolve the effective limit (override or
//! request), then count the request through the selected consistency
//! strategy. The override lookup completes before any counter is touched.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::backend::RatelimitBackend;
use super::request::{Consistency, RatelimitRequest, RatelimitResponse};
use super::strategy::ConsistencyStrategy;
use super::window::Window;
use crate::clock::Clock;
use crate::error::{RatelimitError, StoreError};
use crate::overrides::{EffectiveLimit, OverrideResolver};
use crate::store::CounterKey;

/// What to answer when counter or override state cannot be read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnavailablePolicy {
    /// Admit the request and mark the response as degraded.
    #[default]
    FailOpen,
    /// Return [`RatelimitError::Unavailable`].
    FailClosed,
}

/// Behavioural settings for [`RateLimiter`].
#[derive(Debug, Clone)]
pub struct LimiterSettings {
    /// Strategy used when a request does not name one
    pub default_consistency: Consistency,
    pub unavailable_policy: UnavailablePolicy,
    /// Total attempts per store operation, including the first
    pub retry_attempts: u32,
    /// Base delay between attempts, doubled each retry
    pub retry_backoff: Duration,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            default_consistency: Consistency::Fast,
            unavailable_policy: UnavailablePolicy::FailOpen,
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(10),
        }
    }
}

/// The rate limiter: override resolution plus strategy-based counting.
pub struct RateLimiter {
    resolver: OverrideResolver,
    fast: Arc<dyn ConsistencyStrategy>,
    consistent: Arc<dyn ConsistencyStrategy>,
    clock: Arc<dyn Clock>,
    settings: LimiterSettings,
}

impl RateLimiter {
    pub fn new(
        resolver: OverrideResolver,
        fast: Arc<dyn ConsistencyStrategy>,
        consistent: Arc<dyn ConsistencyStrategy>,
        clock: Arc<dyn Clock>,
        settings: LimiterSettings,
    ) -> Self {
        Self {
            resolver,
            fast,
            consistent,
            clock,
            settings,
        }
    }

    fn strategy(&self, consistency: Consistency) -> &dyn ConsistencyStrategy {
        match consistency {
            Consistency::Fast => self.fast.as_ref(),
            Consistency::Consistent => self.consistent.as_ref(),
        }
    }

    /// Run `op` until it succeeds, fails in a way that may have committed,
    /// or the attempt budget is spent.
    async fn with_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        mut op: F,
    ) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let attempts = self.settings.retry_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= attempts || !e.is_retryable() => return Err(e),
                Err(e) => {
                    let delay = backoff_delay(self.settings.retry_backoff, attempt);
                    debug!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying store operation"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    fn unavailable(
        &self,
        request: &RatelimitRequest,
        effective: &EffectiveLimit,
        now: u64,
        error: StoreError,
    ) -> Result<RatelimitResponse, RatelimitError> {
        match self.settings.unavailable_policy {
            UnavailablePolicy::FailOpen => {
                warn!(
                    namespace = %request.namespace,
                    identifier = %request.identifier,
                    error = %error,
                    "Rate limit state unavailable, failing open"
                );
                let window = Window::containing(now, effective.duration);
                Ok(RatelimitResponse {
                    limit: effective.limit,
                    current: 0,
                    remaining: effective.limit,
                    reset: window.reset(),
                    pass: true,
                    degraded: true,
                })
            }
            UnavailablePolicy::FailClosed => {
                warn!(
                    namespace = %request.namespace,
                    identifier = %request.identifier,
                    error = %error,
                    "Rate limit state unavailable, failing closed"
                );
                Err(error.into())
            }
        }
    }
}

/// Exponential backoff with up to one base interval of jitter.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let base_ms = base.as_millis() as u64;
    let exp = base_ms.saturating_mul(1u64 << (attempt - 1).min(10));
    let jitter = if base_ms > 0 {
        rand::thread_rng().gen_range(0..=base_ms)
    } else {
        0
    };
    Duration::from_millis(exp.saturating_add(jitter))
}

#[async_trait]
impl RatelimitBackend for RateLimiter {
    async fn limit(&self, request: &RatelimitRequest) -> Result<RatelimitResponse, RatelimitError> {
        request.validate()?;

        let now = self.clock.now_ms();
        let consistency = request
            .consistency
            .unwrap_or(self.settings.default_consistency);

        let effective = match self
            .with_retry("resolve_override", || self.resolver.effective_limit(request))
            .await
        {
            Ok(effective) => effective,
            Err(e) => {
                let fallback = EffectiveLimit::from_request(request);
                return self.unavailable(request, &fallback, now, e);
            }
        };

        let window = Window::containing(now, effective.duration);
        let key = CounterKey::new(
            &request.namespace_scope(),
            &request.identifier,
            window.start(),
        );
        let strategy = self.strategy(consistency);

        trace!(
            key = %key,
            strategy = strategy.name(),
            limit = effective.limit,
            cost = request.cost,
            "Checking rate limit"
        );

        let admission = match self
            .with_retry("admit", || {
                strategy.admit(&key, &window, request.cost, effective.limit)
            })
            .await
        {
            Ok(admission) => admission,
            Err(e) => return self.unavailable(request, &effective, now, e),
        };

        if !admission.admitted {
            debug!(
                namespace = %request.namespace,
                identifier = %request.identifier,
                current = admission.current,
                limit = effective.limit,
                strategy = strategy.name(),
                "Rate limit exceeded"
            );
        }

        Ok(RatelimitResponse::new(
            effective.limit,
            admission.current,
            window.reset(),
            admission.admitted,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::overrides::{Namespace, Override, OverrideRecords, OverrideSource};
    use crate::ratelimit::strategy::{ConsistentStrategy, FastSettings, FastStrategy};
    use crate::store::{Admission, MemoryCounterStore, WindowCounterStore};
    use std::sync::atomic::{AtomicU32, Ordering};

    const NOW: u64 = 1_704_067_230_000;

    struct Harness {
        limiter: RateLimiter,
        records: Arc<OverrideRecords>,
        namespace: Namespace,
        clock: Arc<ManualClock>,
    }

    fn harness_with(
        authority: Arc<dyn WindowCounterStore>,
        source: Option<Arc<dyn OverrideSource>>,
        settings: LimiterSettings,
    ) -> Harness {
        let clock = Arc::new(ManualClock::new(NOW));
        let records = Arc::new(OverrideRecords::new());
        let namespace = Namespace::new("ws_1", "namespace");
        records.insert_namespace(namespace.clone()).unwrap();

        let source = source.unwrap_or_else(|| records.clone() as Arc<dyn OverrideSource>);
        let fast = FastStrategy::spawn(
            authority.clone(),
            clock.clone(),
            FastSettings {
                flush_interval: Duration::from_secs(3600),
                ..FastSettings::default()
            },
        );
        let limiter = RateLimiter::new(
            OverrideResolver::uncached(source),
            Arc::new(fast),
            Arc::new(ConsistentStrategy::new(authority)),
            clock.clone(),
            settings,
        );

        Harness {
            limiter,
            records,
            namespace,
            clock,
        }
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(NOW));
        let store = Arc::new(MemoryCounterStore::new(clock, 60_000));
        harness_with(store, None, LimiterSettings::default())
    }

    fn request(identifier: &str, limit: u64) -> RatelimitRequest {
        RatelimitRequest::new("ws_1", "namespace", identifier, limit, 60_000)
            .with_consistency(Consistency::Consistent)
    }

    #[tokio::test]
    async fn test_limit_without_override_uses_request_limit() {
        let h = harness();
        let identifier = uuid::Uuid::new_v4().to_string();

        let res = h.limiter.limit(&request(&identifier, 10)).await.unwrap();
        assert!(res.pass);
        assert_eq!(res.limit, 10);
        assert_eq!(res.current, 1);
        assert_eq!(res.remaining, 9);
    }

    #[tokio::test]
    async fn test_limit_with_override_uses_override_limit() {
        let h = harness();
        let identifier = uuid::Uuid::new_v4().to_string();
        h.records
            .upsert_override(Override::new(&h.namespace, identifier.clone(), 20, 60_000));

        let res = h.limiter.limit(&request(&identifier, 10)).await.unwrap();
        assert!(res.pass);
        assert_eq!(res.limit, 20);
    }

    #[tokio::test]
    async fn test_unknown_namespace_falls_back_to_request() {
        let h = harness();
        let req = RatelimitRequest::new("ws_1", "unconfigured", "user_1", 7, 60_000);

        let res = h.limiter.limit(&req).await.unwrap();
        assert!(res.pass);
        assert_eq!(res.limit, 7);
    }

    #[tokio::test]
    async fn test_sequential_requests_then_rejection() {
        for consistency in [Consistency::Fast, Consistency::Consistent] {
            let h = harness();
            let req = request("user_1", 5).with_consistency(consistency);

            for expected in 1..=5 {
                let res = h.limiter.limit(&req).await.unwrap();
                assert!(res.pass, "{:?} request {} should pass", consistency, expected);
                assert_eq!(res.current, expected);
            }

            let res = h.limiter.limit(&req).await.unwrap();
            assert!(!res.pass);
            assert_eq!(res.current, 6);
            assert_eq!(res.remaining, 0);
        }
    }

    #[tokio::test]
    async fn test_reset_is_end_of_window() {
        let h = harness();
        let res = h.limiter.limit(&request("user_1", 5)).await.unwrap();

        let now = h.clock.now_ms();
        assert!(res.reset > now);
        assert!(res.reset - now <= 60_000);
        assert_eq!(res.reset % 60_000, 0);
    }

    #[tokio::test]
    async fn test_new_window_starts_fresh() {
        let h = harness();
        let req = request("user_1", 1);

        assert!(h.limiter.limit(&req).await.unwrap().pass);
        assert!(!h.limiter.limit(&req).await.unwrap().pass);

        h.clock.advance(60_000);
        let res = h.limiter.limit(&req).await.unwrap();
        assert!(res.pass);
        assert_eq!(res.current, 1);
    }

    #[tokio::test]
    async fn test_override_duration_defines_window() {
        let h = harness();
        h.records
            .upsert_override(Override::new(&h.namespace, "user_1", 3, 1_000));

        let res = h.limiter.limit(&request("user_1", 100)).await.unwrap();
        assert_eq!(res.limit, 3);
        assert!(res.reset - h.clock.now_ms() <= 1_000);
    }

    #[tokio::test]
    async fn test_cost_is_all_or_nothing() {
        let h = harness();

        let res = h.limiter.limit(&request("user_1", 10).with_cost(8)).await.unwrap();
        assert!(res.pass);

        let res = h.limiter.limit(&request("user_1", 10).with_cost(5)).await.unwrap();
        assert!(!res.pass);
        assert_eq!(res.current, 13);

        let res = h.limiter.limit(&request("user_1", 10).with_cost(2)).await.unwrap();
        assert!(res.pass);
        assert_eq!(res.current, 10);
    }

    #[tokio::test]
    async fn test_invalid_request_rejected() {
        let h = harness();
        let err = h.limiter.limit(&request("user_1", 0)).await.unwrap_err();
        assert!(matches!(err, RatelimitError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_concurrent_consistent_requests_admit_exactly_limit() {
        let h = Arc::new(harness());

        let tasks: Vec<_> = (0..40)
            .map(|_| {
                let h = h.clone();
                tokio::spawn(async move { h.limiter.limit(&request("hot", 15)).await.unwrap() })
            })
            .collect();

        let passed = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|r| r.as_ref().unwrap().pass)
            .count();
        assert_eq!(passed, 15);
    }

    /// Store that fails a set number of times before delegating.
    struct FailingStore {
        inner: MemoryCounterStore,
        failures_left: AtomicU32,
    }

    impl FailingStore {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryCounterStore::new(Arc::new(ManualClock::new(NOW)), 60_000),
                failures_left: AtomicU32::new(failures),
            })
        }

        fn check(&self) -> Result<(), StoreError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("connection refused".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl WindowCounterStore for FailingStore {
        async fn increment(
            &self,
            key: &CounterKey,
            reset_at: u64,
            cost: u64,
        ) -> Result<u64, StoreError> {
            self.check()?;
            self.inner.increment(key, reset_at, cost).await
        }

        async fn admit(
            &self,
            key: &CounterKey,
            reset_at: u64,
            cost: u64,
            limit: u64,
        ) -> Result<Admission, StoreError> {
            self.check()?;
            self.inner.admit(key, reset_at, cost, limit).await
        }

        async fn get(&self, key: &CounterKey) -> Result<u64, StoreError> {
            self.check()?;
            self.inner.get(key).await
        }
    }

    fn fast_retry(policy: UnavailablePolicy) -> LimiterSettings {
        LimiterSettings {
            unavailable_policy: policy,
            retry_backoff: Duration::from_millis(1),
            ..LimiterSettings::default()
        }
    }

    #[tokio::test]
    async fn test_transient_store_errors_are_retried() {
        let h = harness_with(FailingStore::new(2), None, fast_retry(UnavailablePolicy::FailClosed));

        let res = h.limiter.limit(&request("user_1", 5)).await.unwrap();
        assert!(res.pass);
        assert!(!res.degraded);
        assert_eq!(res.current, 1);
    }

    #[tokio::test]
    async fn test_store_outage_fails_open_by_default() {
        let h = harness_with(FailingStore::new(100), None, fast_retry(UnavailablePolicy::FailOpen));

        let res = h.limiter.limit(&request("user_1", 5)).await.unwrap();
        assert!(res.pass);
        assert!(res.degraded);
        assert_eq!(res.current, 0);
        assert_eq!(res.limit, 5);
    }

    #[tokio::test]
    async fn test_store_outage_fails_closed_when_configured() {
        let settings = fast_retry(UnavailablePolicy::FailClosed);
        let h = harness_with(FailingStore::new(100), None, settings);

        let err = h.limiter.limit(&request("user_1", 5)).await.unwrap_err();
        assert!(matches!(err, RatelimitError::Unavailable(_)));
    }

    /// Store whose first admit commits and then reports a lost reply.
    struct CommitThenLoseReply {
        inner: MemoryCounterStore,
        lost: AtomicU32,
    }

    #[async_trait]
    impl WindowCounterStore for CommitThenLoseReply {
        async fn increment(
            &self,
            key: &CounterKey,
            reset_at: u64,
            cost: u64,
        ) -> Result<u64, StoreError> {
            self.inner.increment(key, reset_at, cost).await
        }

        async fn admit(
            &self,
            key: &CounterKey,
            reset_at: u64,
            cost: u64,
            limit: u64,
        ) -> Result<Admission, StoreError> {
            let admission = self.inner.admit(key, reset_at, cost, limit).await?;
            if self.lost.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(StoreError::Indeterminate("reply timed out".to_string()));
            }
            Ok(admission)
        }

        async fn get(&self, key: &CounterKey) -> Result<u64, StoreError> {
            self.inner.get(key).await
        }
    }

    #[tokio::test]
    async fn test_possibly_committed_admit_is_not_retried() {
        let store = Arc::new(CommitThenLoseReply {
            inner: MemoryCounterStore::new(Arc::new(ManualClock::new(NOW)), 60_000),
            lost: AtomicU32::new(0),
        });
        let h = harness_with(
            store.clone(),
            None,
            fast_retry(UnavailablePolicy::FailClosed),
        );
        let req = request("user_1", 5).with_cost(2);
        let key = CounterKey::new("ws_1:namespace", "user_1", NOW / 60_000 * 60_000);

        let err = h.limiter.limit(&req).await.unwrap_err();
        assert!(matches!(err, RatelimitError::Unavailable(_)));
        assert_eq!(store.inner.get(&key).await.unwrap(), 2);

        let res = h.limiter.limit(&req).await.unwrap();
        assert!(res.pass);
        assert_eq!(res.current, 4);
    }

    /// Override source that cannot answer.
    struct BrokenSource;

    #[async_trait]
    impl OverrideSource for BrokenSource {
        async fn find_namespace(&self, _: &str, _: &str) -> Result<Option<Namespace>, StoreError> {
            Err(StoreError::Unavailable("records unavailable".to_string()))
        }

        async fn find_override(&self, _: &str, _: &str) -> Result<Option<Override>, StoreError> {
            Err(StoreError::Unavailable("records unavailable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_override_lookup_failure_is_not_silent() {
        let store = Arc::new(MemoryCounterStore::new(Arc::new(ManualClock::new(NOW)), 60_000));
        let h = harness_with(
            store.clone(),
            Some(Arc::new(BrokenSource)),
            fast_retry(UnavailablePolicy::FailClosed),
        );
        let err = h.limiter.limit(&request("user_1", 5)).await.unwrap_err();
        assert!(matches!(err, RatelimitError::Unavailable(_)));

        let settings = fast_retry(UnavailablePolicy::FailOpen);
        let h = harness_with(store, Some(Arc::new(BrokenSource)), settings);
        let res = h.limiter.limit(&request("user_1", 5)).await.unwrap();
        assert!(res.degraded);
    }

    #[test]
    fn test_backoff_grows() {
        let base = Duration::from_millis(10);
        let first = backoff_delay(base, 1);
        let third = backoff_delay(base, 3);
        assert!(first >= Duration::from_millis(10) && first <= Duration::from_millis(20));
        assert!(third >= Duration::from_millis(40) && third <= Duration::from_millis(50));
        assert_eq!(backoff_delay(Duration::ZERO, 5), Duration::ZERO);
    }
}
