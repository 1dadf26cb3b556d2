//! Request handlers.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::error::ApiError;
use super::router::AppState;
use crate::auth::constant_time_eq;
use crate::ratelimit::{Consistency, RatelimitRequest, RatelimitResponse};
use crate::store::{CounterCommand, CounterReply, CLUSTER_SECRET_HEADER};

/// Body of `POST /v1/ratelimits.limit`.
///
/// Numbers are signed on the wire so negative values are reported as invalid
/// requests rather than parse failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitRequestBody {
    pub namespace: String,
    pub identifier: String,
    pub limit: i64,
    /// Window duration in milliseconds
    pub duration: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<i64>,
    /// `true` selects the fast strategy, `false` the consistent one
    #[serde(default, rename = "async", skip_serializing_if = "Option::is_none")]
    pub is_async: Option<bool>,
}

impl LimitRequestBody {
    fn into_request(self, workspace_id: &str) -> Result<RatelimitRequest, ApiError> {
        if self.limit <= 0 {
            return Err(ApiError::InvalidRequest("limit must be positive".to_string()));
        }
        if self.duration <= 0 {
            return Err(ApiError::InvalidRequest("duration must be positive".to_string()));
        }
        let cost = self.cost.unwrap_or(1);
        if cost < 0 {
            return Err(ApiError::InvalidRequest("cost must not be negative".to_string()));
        }

        let mut request = RatelimitRequest::new(
            workspace_id,
            self.namespace,
            self.identifier,
            self.limit as u64,
            self.duration as u64,
        )
        .with_cost(cost as u64);

        if let Some(is_async) = self.is_async {
            request = request.with_consistency(if is_async {
                Consistency::Fast
            } else {
                Consistency::Consistent
            });
        }
        Ok(request)
    }
}

/// Body of a successful limit response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitResponseBody {
    pub limit: u64,
    pub remaining: u64,
    /// End of the current window, milliseconds since the epoch
    pub reset: u64,
    pub pass: bool,
    /// Present when the decision was made without counter state
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
}

impl From<RatelimitResponse> for LimitResponseBody {
    fn from(res: RatelimitResponse) -> Self {
        Self {
            limit: res.limit,
            remaining: res.remaining,
            reset: res.reset,
            pass: res.pass,
            degraded: res.degraded,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessResponse {
    pub status: String,
}

/// `POST /v1/ratelimits.limit`
#[instrument(skip_all)]
pub(super) async fn limit(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<LimitRequestBody>, JsonRejection>,
) -> Result<Json<LimitResponseBody>, ApiError> {
    let authorization = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    let principal = state.keys.authenticate(authorization)?;

    let Json(body) = payload?;
    principal.authorize_limit(&body.namespace)?;

    debug!(
        namespace = %body.namespace,
        identifier = %body.identifier,
        limit = body.limit,
        "Processing limit request"
    );

    let request = body.into_request(&principal.workspace_id)?;
    let response = state.limiter.limit(&request).await?;
    Ok(Json(response.into()))
}

/// `POST /v1/internal/counters`
pub(super) async fn internal_counters(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<CounterCommand>, JsonRejection>,
) -> Result<Json<CounterReply>, ApiError> {
    if let Some(secret) = &state.cluster_secret {
        let matches = headers
            .get(CLUSTER_SECRET_HEADER)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|presented| constant_time_eq(presented, secret));
        if !matches {
            warn!("Rejected counter command with bad cluster secret");
            return Err(ApiError::Unauthorized("invalid cluster secret".to_string()));
        }
    }

    let Json(command) = payload?;
    let authority = state
        .authority
        .as_ref()
        .ok_or_else(|| ApiError::Unavailable("no counter authority on this node".to_string()))?;

    Ok(Json(command.apply(authority)))
}

/// `GET /v1/liveness`
pub(super) async fn liveness() -> Json<LivenessResponse> {
    Json(LivenessResponse {
        status: "serving".to_string(),
    })
}
