//! HTTP API served with axum.
//!
//! - `POST /v1/ratelimits.limit` is the public limit operation.
//! - `POST /v1/internal/counters` receives counter commands forwarded by
//!   peers for keys this node owns.
//! - `GET /v1/liveness` answers while the process is serving.

mod error;
mod handlers;
mod router;
mod server;

pub use error::ApiError;
pub use handlers::{LimitRequestBody, LimitResponseBody, LivenessResponse};
pub use router::{build_router, AppState};
pub use server::HttpServer;
