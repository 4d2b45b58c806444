//! # Web API Error Types
//!
//! [`ApiError`] maps [`SyncError`] onto HTTP statuses and a uniform JSON body:
//! `{"error": {"code": ..., "message": ...}}`.

use crate::error::SyncError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Service temporarily unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal server error")]
    Internal,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, "NOT_FOUND", m.clone()),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", m.clone()),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, "CONFLICT", m.clone()),
            ApiError::ServiceUnavailable(m) => {
                (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", m.clone())
            }
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "Internal server error".to_string(),
            ),
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Validation(m) => ApiError::BadRequest(m),
            SyncError::Conflict(m) => ApiError::Conflict(m),
            SyncError::NotFound(m) => ApiError::NotFound(m),
            e @ SyncError::CircuitOpen { .. } => ApiError::ServiceUnavailable(e.to_string()),
            other => {
                // Internals stay in the log, not in the response
                error!(error = %other, code = other.code(), "Request failed");
                ApiError::Internal
            }
        }
    }
}

impl From<uuid::Error> for ApiError {
    fn from(e: uuid::Error) -> Self {
        ApiError::BadRequest(format!("invalid UUID: {e}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        let body = json!({
            "error": {
                "code": code,
                "message": message,
            }
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_sync_error_mapping() {
        let cases = [
            (SyncError::validation("bad month"), StatusCode::BAD_REQUEST),
            (SyncError::Conflict("busy".into()), StatusCode::CONFLICT),
            (SyncError::NotFound("sync".into()), StatusCode::NOT_FOUND),
            (
                SyncError::CircuitOpen {
                    component: "datastore".into(),
                    cooldown: Duration::from_secs(30),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (SyncError::database("connection refused"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), status);
        }
    }
}
