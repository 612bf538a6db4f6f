use crate::services::extraction::ExtractError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Bad Request: {0}")]
    BadRequest(String),

    #[error("Payload Too Large: {0}")]
    PayloadTooLarge(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Internal Server Error: {0}")]
    Internal(String),
}

impl From<ExtractError> for AppError {
    fn from(err: ExtractError) -> Self {
        match err {
            ExtractError::Validation(e) if e.is_too_large() => {
                AppError::PayloadTooLarge(e.to_string())
            }
            ExtractError::Validation(e) => AppError::BadRequest(e.to_string()),
            ExtractError::TempFile(e) => AppError::Internal(format!("Failed to stage upload: {}", e)),
            e @ (ExtractError::Upload { .. } | ExtractError::Generation(_)) => {
                AppError::Upstream(e.user_message())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg),
            AppError::Upstream(msg) => {
                tracing::error!("Upstream error: {}", msg);
                (StatusCode::BAD_GATEWAY, msg)
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}
