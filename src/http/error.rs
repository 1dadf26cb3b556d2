use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::AuthError;
use crate::error::RatelimitError;

/// Error returned by an HTTP handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// The body could not be parsed
    #[error("{0}")]
    BadRequest(String),
    /// The body parsed but carried values the limiter rejects
    #[error("{0}")]
    InvalidRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    Unavailable(String),
}

/// Wire shape: `{ "error": { "kind": ..., "message": ... } }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: String,
    pub message: String,
}

impl ApiError {
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::Unauthorized(_) => "unauthorized",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::Unavailable(_) => "unavailable",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) | ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl From<RatelimitError> for ApiError {
    fn from(err: RatelimitError) -> Self {
        match err {
            RatelimitError::InvalidRequest(msg) => ApiError::InvalidRequest(msg),
            RatelimitError::Unavailable(msg) => ApiError::Unavailable(msg),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingCredentials | AuthError::UnknownKey => {
                ApiError::Unauthorized(err.to_string())
            }
            AuthError::Forbidden(_) => ApiError::Forbidden(err.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                kind: self.kind().to_string(),
                message: self.to_string(),
            },
        };
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError::BadRequest(String::new()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::InvalidRequest(String::new()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::Unauthorized(String::new()).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::Forbidden(String::new()).status(), StatusCode::FORBIDDEN);
        assert_eq!(
            ApiError::Unavailable(String::new()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_from_ratelimit_error_keeps_kind() {
        let err = RatelimitError::Unavailable("store down".to_string());
        let kind = err.kind();
        let api: ApiError = err.into();
        assert_eq!(api.kind(), kind);
        assert_eq!(api.to_string(), "store down");
    }

    #[test]
    fn test_from_auth_error() {
        let api: ApiError = AuthError::UnknownKey.into();
        assert_eq!(api.status(), StatusCode::UNAUTHORIZED);

        let api: ApiError = AuthError::Forbidden("ratelimit.ns.limit".to_string()).into();
        assert_eq!(api.kind(), "forbidden");
        assert_eq!(api.to_string(), "missing permission: ratelimit.ns.limit");
    }
}
