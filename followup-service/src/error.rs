use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Body of every error response, `{"error": {"code", "message"}}`
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct ErrorDetails {
    /// A machine-readable error code string (e.g., "INVALID_BODY", "MODEL_ERROR")
    pub code: String,
    /// A human-readable error message describing what went wrong
    pub message: String,
}

/// Errors returned by the follow-up service endpoints
#[derive(Debug, Error)]
pub enum FollowUpServiceError {
    /// The request body is not valid JSON or misses a required field
    #[error("Invalid request body: {message}")]
    InvalidBody {
        message: String,
        endpoint: String,
    },

    /// Generation failed on the model thread
    #[error("Model error: {model_error}")]
    ModelError {
        model_error: String,
        endpoint: String,
    },

    /// The model thread is unreachable
    #[error("Internal server error: {message}")]
    InternalError {
        message: String,
        endpoint: String,
    },
}

impl FollowUpServiceError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidBody { .. } => "INVALID_BODY",
            Self::ModelError { .. } => "MODEL_ERROR",
            Self::InternalError { .. } => "INTERNAL_ERROR",
        }
    }

    /// Message returned to clients, without internal details
    fn client_message(&self) -> String {
        match self {
            Self::InvalidBody { message, .. } => format!("Invalid request body: {message}"),
            Self::ModelError { .. } => "Failed to generate a follow-up question".to_string(),
            Self::InternalError { .. } => "Internal server error occurred".to_string(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidBody { .. } => StatusCode::BAD_REQUEST,
            Self::ModelError { .. } | Self::InternalError { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn endpoint(&self) -> &str {
        match self {
            Self::InvalidBody { endpoint, .. }
            | Self::ModelError { endpoint, .. }
            | Self::InternalError { endpoint, .. } => endpoint,
        }
    }
}

impl IntoResponse for FollowUpServiceError {
    fn into_response(self) -> Response {
        tracing::error!(
            target = "followup-service",
            event = "error_occurred",
            endpoint = self.endpoint(),
            error = %self,
        );
        let error_response = ErrorResponse {
            error: ErrorDetails {
                code: self.error_code().to_string(),
                message: self.client_message(),
            },
        };
        (self.status_code(), Json(error_response)).into_response()
    }
}
