//! API response and error types.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use kairos_core::{ErrorResponse, KairosError};
use kairos_jobs::JobError;
use serde::{Deserialize, Serialize};

/// Application error type for Axum.
///
/// Rendered as `{"error": ..., "code": ...}` with the status from
/// [`KairosError::status_code`].
#[derive(Debug)]
pub struct ApiError(pub KairosError);

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self(KairosError::validation(message))
    }
}

impl From<KairosError> for ApiError {
    fn from(err: KairosError) -> Self {
        Self(err)
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            tracing::error!(error = %self.0, code = self.0.error_code(), "Request failed");
        }

        (status, Json(ErrorResponse::from_error(&self.0))).into_response()
    }
}

/// Result type for Axum handlers.
pub type ApiResult<T> = Result<T, ApiError>;

/// Simple message response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
