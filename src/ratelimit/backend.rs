//! Rate limiter trait for abstracting the active and noop implementations.

use async_trait::async_trait;

use super::request::{RatelimitRequest, RatelimitResponse};
use crate::error::RatelimitError;

/// Trait for rate limiter implementations.
///
/// This trait abstracts over the [`RateLimiter`](super::RateLimiter) and the
/// [`NoopRateLimiter`](super::NoopRateLimiter) so the HTTP layer works with
/// whichever variant the configuration selects.
#[async_trait]
pub trait RatelimitBackend: Send + Sync {
    /// Decide whether the request passes and count it.
    async fn limit(&self, request: &RatelimitRequest) -> Result<RatelimitResponse, RatelimitError>;
}
