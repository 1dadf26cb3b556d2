//! Service wiring.
//!
//! Builds the limiter, its stores and background tasks from configuration
//! and owns their shutdown order.

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::KeyRing;
use crate::clock::{Clock, SystemClock};
use crate::config::HivelimitConfig;
use crate::error::{HivelimitError, Result};
use crate::http::{build_router, AppState, HttpServer};
use crate::mesh::Cluster;
use crate::overrides::{spawn_reloader, OverrideRecords, OverrideResolver};
use crate::ratelimit::{
    ConsistentStrategy, FastStrategy, NoopRateLimiter, RateLimiter, RatelimitBackend,
};
use crate::store::{
    spawn_sweeper, GossipCounterStore, MemoryCounterStore, RoutedCounterStore, WindowCounterStore,
};

/// A fully wired service instance.
pub struct App {
    config: HivelimitConfig,
    limiter: Arc<dyn RatelimitBackend>,
    router: Router,
    records: Option<Arc<OverrideRecords>>,
    fast: Option<Arc<FastStrategy>>,
    cluster: Option<Arc<Cluster>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl App {
    /// Build every component named by `config`. Must run inside a Tokio
    /// runtime; background tasks start immediately.
    pub async fn build(config: HivelimitConfig) -> Result<Self> {
        config.validate()?;

        let keys = KeyRing::new(&config.auth.root_keys);
        if keys.is_empty() {
            warn!("No root keys configured, every limit request will be rejected");
        }

        let cancel = CancellationToken::new();

        if !config.rate_limiting.enabled {
            info!("Rate limiting disabled, admitting every request");
            let limiter: Arc<dyn RatelimitBackend> = Arc::new(NoopRateLimiter::new());
            let router = build_router(AppState::new(limiter.clone(), keys));
            return Ok(Self {
                config,
                limiter,
                router,
                records: None,
                fast: None,
                cluster: None,
                cancel,
                tasks: Vec::new(),
            });
        }

        let rl = &config.rate_limiting;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let grace_ms = rl.counter_grace_period_ms;
        let mut tasks = Vec::new();

        let records = match &rl.overrides_path {
            Some(path) => {
                let records = Arc::new(OverrideRecords::load(path).await?);
                tasks.push(spawn_reloader(
                    records.clone(),
                    path.clone(),
                    rl.overrides_reload_interval(),
                    cancel.clone(),
                ));
                records
            }
            None => Arc::new(OverrideRecords::new()),
        };
        info!(namespaces = records.namespace_count(), "Override records loaded");

        let resolver = OverrideResolver::new(
            records.clone(),
            rl.override_cache_ttl(),
            rl.override_cache_capacity,
        );

        let local = Arc::new(MemoryCounterStore::new(clock.clone(), grace_ms));
        tasks.push(spawn_sweeper(local.clone(), rl.sweep_interval(), cancel.clone()));

        let mut state_authority = None;
        let (shared, authority, cluster): (
            Arc<dyn WindowCounterStore>,
            Arc<dyn WindowCounterStore>,
            Option<Arc<Cluster>>,
        ) = if config.cluster.enabled {
            let cluster_config = config.cluster.to_cluster_config(config.server.http_addr)?;
            let cluster = Arc::new(Cluster::start(cluster_config).await?);

            let gossip: Arc<dyn WindowCounterStore> =
                Arc::new(GossipCounterStore::new(cluster.clone(), clock.clone(), grace_ms));
            tasks.push(spawn_sweeper(gossip.clone(), rl.sweep_interval(), cancel.clone()));

            let routed = RoutedCounterStore::new(
                cluster.clone(),
                local.clone(),
                config.cluster.forward_timeout(),
                config.cluster.secret.clone(),
            )
            .map_err(|e| HivelimitError::Http(e.to_string()))?;

            let routed: Arc<dyn WindowCounterStore> = Arc::new(routed);

            state_authority = Some(local.clone());
            info!(node_id = %cluster.node_id(), "Cluster mode enabled");
            (gossip, routed, Some(cluster))
        } else {
            info!("Single-node mode");
            let store: Arc<dyn WindowCounterStore> = local.clone();
            (store.clone(), store, None)
        };

        let fast = Arc::new(FastStrategy::spawn(
            shared,
            clock.clone(),
            config.fast.settings(grace_ms),
        ));
        let consistent = Arc::new(ConsistentStrategy::new(authority));

        let limiter: Arc<dyn RatelimitBackend> = Arc::new(RateLimiter::new(
            resolver,
            fast.clone(),
            consistent,
            clock,
            rl.limiter_settings(),
        ));

        let mut state = AppState::new(limiter.clone(), keys);
        if let Some(store) = state_authority {
            state = state.with_counter_authority(store, config.cluster.secret.clone());
        }
        let router = build_router(state);

        info!(
            default_consistency = ?rl.default_consistency,
            unavailable_policy = ?rl.unavailable_policy,
            "Rate limiter initialized"
        );

        Ok(Self {
            config,
            limiter,
            router,
            records: Some(records),
            fast: Some(fast),
            cluster,
            cancel,
            tasks,
        })
    }

    pub fn limiter(&self) -> Arc<dyn RatelimitBackend> {
        self.limiter.clone()
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// The in-process override record store, absent when limiting is disabled.
    pub fn records(&self) -> Option<&Arc<OverrideRecords>> {
        self.records.as_ref()
    }

    /// The mesh handle when cluster mode is enabled.
    pub fn cluster(&self) -> Option<&Arc<Cluster>> {
        self.cluster.as_ref()
    }

    /// Serve HTTP until `signal` resolves, then shut everything down.
    pub async fn run<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let server = match HttpServer::bind(self.config.server.http_addr, self.router()).await {
            Ok(server) => server,
            Err(e) => {
                self.shutdown().await;
                return Err(e);
            }
        };
        let served = server.serve_with_shutdown(signal).await;
        self.shutdown().await;
        served
    }

    /// Flush pending increments, stop background tasks and leave the mesh.
    pub async fn shutdown(self) {
        if let Some(fast) = &self.fast {
            fast.shutdown().await;
        }

        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        if let Some(cluster) = &self.cluster {
            if let Err(e) = cluster.shutdown().await {
                warn!(error = %e, "Cluster shutdown failed");
            }
        }

        info!("Shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::RatelimitRequest;
    use std::io::Write;

    #[tokio::test]
    async fn test_disabled_uses_noop() {
        let config = HivelimitConfig::from_yaml("rate_limiting:\n  enabled: false\n").unwrap();
        let app = App::build(config).await.unwrap();

        let req = RatelimitRequest::new("ws", "ns", "id", 1, 1000);
        for _ in 0..3 {
            let res = app.limiter().limit(&req).await.unwrap();
            assert!(res.pass);
            assert_eq!(res.current, 0);
        }
        assert!(app.records().is_none());
        app.shutdown().await;
    }

    #[tokio::test]
    async fn test_single_node_counts() {
        let app = App::build(HivelimitConfig::default()).await.unwrap();
        let req = RatelimitRequest::new("ws", "ns", "id", 2, 3_600_000)
            .with_consistency(crate::ratelimit::Consistency::Consistent);

        assert!(app.limiter().limit(&req).await.unwrap().pass);
        assert!(app.limiter().limit(&req).await.unwrap().pass);
        assert!(!app.limiter().limit(&req).await.unwrap().pass);
        app.shutdown().await;
    }

    #[tokio::test]
    async fn test_overrides_loaded_from_file() {
        let mut path = std::env::temp_dir();
        path.push(format!("hivelimit-overrides-{}.yaml", uuid::Uuid::new_v4()));
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            "namespaces:
  - workspace_id: ws
    name: ns
    overrides:
      - identifier: vip
        limit: 50
        duration: 60000
"
        )
        .unwrap();

        let mut config = HivelimitConfig::default();
        config.rate_limiting.overrides_path = Some(path.to_string_lossy().into_owned());
        let app = App::build(config).await.unwrap();

        let res = app
            .limiter()
            .limit(&RatelimitRequest::new("ws", "ns", "vip", 5, 1000))
            .await
            .unwrap();
        assert_eq!(res.limit, 50);
        assert_eq!(app.records().unwrap().namespace_count(), 1);

        app.shutdown().await;
        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn test_missing_overrides_file_fails_build() {
        let mut config = HivelimitConfig::default();
        config.rate_limiting.overrides_path =
            Some("/nonexistent/hivelimit/overrides.yaml".to_string());
        assert!(matches!(App::build(config).await, Err(HivelimitError::Io(_))));
    }

    #[tokio::test]
    async fn test_bind_failure_still_shuts_down() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = HivelimitConfig::default();
        config.server.http_addr = taken.local_addr().unwrap();

        let app = App::build(config).await.unwrap();
        let cancel = app.cancel.clone();
        assert!(!app.tasks.is_empty());

        assert!(app.run(std::future::pending()).await.is_err());
        assert!(cancel.is_cancelled());
    }
}
