//! API Error Types
//!
//! Defines error types for the API layer and implements conversion
//! to HTTP responses with appropriate status codes.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::engine::EngineError;
use crate::filter::FilterError;
use crate::hub::HubError;
use crate::store::StoreError;

/// API error types
#[derive(Error, Debug)]
pub enum ApiError {
    /// Request validation failed
    #[error("Validation error: {0}")]
    Validation(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Request conflicts with current state
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::FeedNotFound(_) | EngineError::FilterNotFound(_) => {
                ApiError::NotFound(error.to_string())
            }
            EngineError::NotActive(_) => ApiError::Conflict(error.to_string()),
            EngineError::Connector(ref e) if e.is_config() => ApiError::Validation(error.to_string()),
            EngineError::Filter(_) => ApiError::Validation(error.to_string()),
            EngineError::Hub(HubError::SubscriptionNotFound { .. }) => ApiError::NotFound(error.to_string()),
            EngineError::Hub(HubError::TooManyConnections(_)) => ApiError::Conflict(error.to_string()),
            EngineError::Store(StoreError::FeedNotFound(_) | StoreError::FilterNotFound(_)) => {
                ApiError::NotFound(error.to_string())
            }
            EngineError::Store(StoreError::InvalidFeed { .. } | StoreError::InvalidFilter { .. }) => {
                ApiError::Validation(error.to_string())
            }
            EngineError::Connector(_) | EngineError::Store(_) => ApiError::Internal(error.to_string()),
        }
    }
}

impl From<FilterError> for ApiError {
    fn from(error: FilterError) -> Self {
        ApiError::Validation(error.to_string())
    }
}

/// Error response body
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
    pub request_id: String,
}

/// Error details
#[derive(Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        let request_id = uuid::Uuid::new_v4().to_string();

        if status.is_server_error() {
            tracing::error!(
                request_id = %request_id,
                error_code = %code,
                error_message = %self,
                "API error occurred"
            );
        } else {
            tracing::debug!(
                request_id = %request_id,
                error_code = %code,
                error_message = %self,
                "API request rejected"
            );
        }

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message: self.to_string(),
            },
            request_id,
        };

        (status, Json(body)).into_response()
    }
}

/// Result type for API operations
pub type ApiResult<T> = Result<T, ApiError>;
