//! API error handling.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use buildfleet_scheduler::SchedulerError;
use serde_json::json;
use tracing::error;

/// API error type.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Conflict(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => {
                error!(error = %msg, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::NotFound(msg) => ApiError::NotFound(msg),
            SchedulerError::Unauthorized(msg) => ApiError::Unauthorized(msg),
            SchedulerError::InvalidState(msg)
            | SchedulerError::Duplicate(msg)
            | SchedulerError::Contention(msg) => ApiError::Conflict(msg),
            SchedulerError::Timeout(msg) => ApiError::Unavailable(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<buildfleet_core::Error> for ApiError {
    fn from(err: buildfleet_core::Error) -> Self {
        match err {
            buildfleet_core::Error::NotFound(msg) => ApiError::NotFound(msg),
            buildfleet_core::Error::InvalidInput(msg) => ApiError::BadRequest(msg),
            buildfleet_core::Error::Unauthorized(msg) => ApiError::Unauthorized(msg),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<buildfleet_db::DbError> for ApiError {
    fn from(err: buildfleet_db::DbError) -> Self {
        SchedulerError::from(err).into()
    }
}
