//! Override resolution with a short-lived lookup cache.

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use tracing::{debug, trace};

use super::records::{Override, OverrideSource};
use crate::error::StoreError;
use crate::ratelimit::RatelimitRequest;

/// Where an effective limit came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimitSource {
    /// The caller-supplied limit and duration
    Request,
    /// A configured override
    Override { override_id: String },
}

/// The limit and window duration that govern a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveLimit {
    pub limit: u64,
    /// Window duration in milliseconds
    pub duration: u64,
    pub source: LimitSource,
}

impl EffectiveLimit {
    /// The request's own limit and duration.
    pub fn from_request(request: &RatelimitRequest) -> Self {
        Self {
            limit: request.limit,
            duration: request.duration,
            source: LimitSource::Request,
        }
    }

    fn from_override(record: &Override) -> Self {
        Self {
            limit: record.limit,
            duration: record.duration,
            source: LimitSource::Override {
                override_id: record.id.clone(),
            },
        }
    }
}

type CacheKey = (String, String, String);

/// Resolves the override, if any, for a (namespace, identifier) pair.
///
/// Lookup results (including "no override") are cached for a short TTL.
/// Failed lookups are never cached and are returned as errors, so a source
/// outage cannot be mistaken for the absence of an override.
pub struct OverrideResolver {
    source: Arc<dyn OverrideSource>,
    cache: Option<Cache<CacheKey, Option<Override>>>,
}

impl OverrideResolver {
    /// Create a resolver; a zero `ttl` disables caching.
    pub fn new(source: Arc<dyn OverrideSource>, ttl: Duration, capacity: u64) -> Self {
        let cache = (!ttl.is_zero()).then(|| {
            Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build()
        });
        Self { source, cache }
    }

    /// Create a resolver that always reads through to the source.
    pub fn uncached(source: Arc<dyn OverrideSource>) -> Self {
        Self {
            source,
            cache: None,
        }
    }

    /// Find the override for `identifier` in a workspace's namespace.
    ///
    /// A namespace that does not exist yields `Ok(None)`.
    pub async fn resolve(
        &self,
        workspace_id: &str,
        namespace: &str,
        identifier: &str,
    ) -> Result<Option<Override>, StoreError> {
        let key = (
            workspace_id.to_string(),
            namespace.to_string(),
            identifier.to_string(),
        );

        if let Some(cache) = &self.cache {
            if let Some(cached) = cache.get(&key).await {
                trace!(namespace = %namespace, identifier = %identifier, "Override cache hit");
                return Ok(cached);
            }
        }

        let found = self.lookup(workspace_id, namespace, identifier).await?;

        if let Some(cache) = &self.cache {
            cache.insert(key, found.clone()).await;
        }
        Ok(found)
    }

    /// The effective limit for a request: the override's when one exists.
    pub async fn effective_limit(
        &self,
        request: &RatelimitRequest,
    ) -> Result<EffectiveLimit, StoreError> {
        let found = self
            .resolve(&request.workspace_id, &request.namespace, &request.identifier)
            .await?;

        Ok(match found {
            Some(record) => {
                debug!(
                    namespace = %request.namespace,
                    identifier = %request.identifier,
                    override_id = %record.id,
                    limit = record.limit,
                    duration = record.duration,
                    "Applying override"
                );
                EffectiveLimit::from_override(&record)
            }
            None => EffectiveLimit::from_request(request),
        })
    }

    async fn lookup(
        &self,
        workspace_id: &str,
        namespace: &str,
        identifier: &str,
    ) -> Result<Option<Override>, StoreError> {
        let Some(ns) = self.source.find_namespace(workspace_id, namespace).await? else {
            trace!(namespace = %namespace, "Namespace not configured, using request limits");
            return Ok(None);
        };
        self.source.find_override(&ns.id, identifier).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overrides::records::{Namespace, OverrideRecords};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Source that counts lookups and can be switched to fail.
    #[derive(Default)]
    struct CountingSource {
        inner: OverrideRecords,
        lookups: AtomicUsize,
        failing: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl OverrideSource for CountingSource {
        async fn find_namespace(
            &self,
            workspace_id: &str,
            name: &str,
        ) -> Result<Option<Namespace>, StoreError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("database down".to_string()));
            }
            self.inner.find_namespace(workspace_id, name).await
        }

        async fn find_override(
            &self,
            namespace_id: &str,
            identifier: &str,
        ) -> Result<Option<Override>, StoreError> {
            self.inner.find_override(namespace_id, identifier).await
        }
    }

    fn source_with_override() -> Arc<CountingSource> {
        let source = CountingSource::default();
        let ns = Namespace::new("ws_1", "namespace");
        source.inner.insert_namespace(ns.clone()).unwrap();
        source
            .inner
            .upsert_override(Override::new(&ns, "user_1", 20, 60_000));
        Arc::new(source)
    }

    #[tokio::test]
    async fn test_override_wins_over_request() {
        let resolver = OverrideResolver::uncached(source_with_override());
        let request = RatelimitRequest::new("ws_1", "namespace", "user_1", 10, 1_000);

        let effective = resolver.effective_limit(&request).await.unwrap();
        assert_eq!((effective.limit, effective.duration), (20, 60_000));
        assert!(matches!(effective.source, LimitSource::Override { .. }));
    }

    #[tokio::test]
    async fn test_request_limit_without_override() {
        let resolver = OverrideResolver::uncached(source_with_override());

        let other_identifier = RatelimitRequest::new("ws_1", "namespace", "user_2", 10, 1_000);
        let effective = resolver.effective_limit(&other_identifier).await.unwrap();
        assert_eq!(effective, EffectiveLimit::from_request(&other_identifier));

        let missing_namespace = RatelimitRequest::new("ws_1", "nope", "user_1", 10, 1_000);
        let effective = resolver.effective_limit(&missing_namespace).await.unwrap();
        assert_eq!(effective.source, LimitSource::Request);
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent_and_cached() {
        let source = source_with_override();
        let resolver = OverrideResolver::new(source.clone(), Duration::from_secs(60), 100);

        let first = resolver.resolve("ws_1", "namespace", "user_1").await.unwrap();
        let second = resolver.resolve("ws_1", "namespace", "user_1").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(source.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_source_failure_is_not_treated_as_no_override() {
        let source = source_with_override();
        source.failing.store(true, Ordering::SeqCst);
        let resolver = OverrideResolver::new(source.clone(), Duration::from_secs(60), 100);

        let result = resolver.resolve("ws_1", "namespace", "user_1").await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));

        // The failure was not cached
        source.failing.store(false, Ordering::SeqCst);
        let found = resolver.resolve("ws_1", "namespace", "user_1").await.unwrap();
        assert_eq!(found.map(|o| o.limit), Some(20));
    }
}
