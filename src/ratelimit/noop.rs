use async_trait::async_trait;
use tracing::trace;

use super::backend::RatelimitBackend;
use super::request::{RatelimitRequest, RatelimitResponse};
use crate::error::RatelimitError;

/// Limiter used when rate limiting is disabled. Admits everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRateLimiter;

impl NoopRateLimiter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RatelimitBackend for NoopRateLimiter {
    async fn limit(&self, request: &RatelimitRequest) -> Result<RatelimitResponse, RatelimitError> {
        trace!(
            namespace = %request.namespace,
            identifier = %request.identifier,
            "Noop limit"
        );
        Ok(RatelimitResponse {
            limit: request.limit,
            current: 0,
            remaining: request.limit,
            reset: 0,
            pass: true,
            degraded: false,
        })
    }
}
