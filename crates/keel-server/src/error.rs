use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use keel_core::error::AppError;

use crate::dto::ErrorResponse;

/// Engine error carried out of a handler.
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

impl ApiError {
    /// HTTP status and machine-readable code for the wrapped error.
    fn classify(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            AppError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            AppError::SerializationError(_) => (StatusCode::BAD_REQUEST, "serialization_error"),
            AppError::JobNotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AppError::InvalidTransition(_) => (StatusCode::CONFLICT, "invalid_transition"),
            AppError::RateLimitExceeded => (StatusCode::TOO_MANY_REQUESTS, "rate_limit_exceeded"),
            AppError::StoreError(_) => (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable"),
            AppError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            AppError::ConfigError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.classify();
        if status.is_server_error() {
            tracing::error!(error = %self.0, %code, "Request failed");
        }

        let body = ErrorResponse {
            error: code.to_string(),
            message: self.0.to_string(),
        };
        (status, axum::Json(body)).into_response()
    }
}
