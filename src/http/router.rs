//! Axum router configuration.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use super::handlers::{internal_counters, limit, liveness};
use crate::auth::KeyRing;
use crate::ratelimit::RatelimitBackend;
use crate::store::{MemoryCounterStore, INTERNAL_COUNTERS_PATH};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub(super) limiter: Arc<dyn RatelimitBackend>,
    pub(super) keys: Arc<KeyRing>,
    pub(super) authority: Option<Arc<MemoryCounterStore>>,
    pub(super) cluster_secret: Option<Arc<str>>,
}

impl AppState {
    pub fn new(limiter: Arc<dyn RatelimitBackend>, keys: KeyRing) -> Self {
        Self {
            limiter,
            keys: Arc::new(keys),
            authority: None,
            cluster_secret: None,
        }
    }

    /// Serve forwarded counter commands from `store`.
    ///
    /// When `secret` is set, forwarded commands must carry it.
    pub fn with_counter_authority(
        mut self,
        store: Arc<MemoryCounterStore>,
        secret: Option<String>,
    ) -> Self {
        self.authority = Some(store);
        self.cluster_secret = secret.map(Arc::from);
        self
    }
}

/// Build the complete router.
///
/// Routes:
/// - `POST /v1/ratelimits.limit`
/// - `POST /v1/internal/counters` (only when a counter authority is set)
/// - `GET  /v1/liveness`
pub fn build_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/v1/ratelimits.limit", post(limit))
        .route("/v1/liveness", get(liveness));

    if state.authority.is_some() {
        router = router.route(INTERNAL_COUNTERS_PATH, post(internal_counters));
    }

    router.with_state(state)
}
