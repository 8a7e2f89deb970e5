use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),

    /// The origin answered with a non-success status.
    #[error("Origin returned HTTP {status}: {details}")]
    Upstream { status: StatusCode, details: String },

    #[error("Failed to reach origin API: {0}")]
    OriginUnreachable(String),

    #[error("Origin fetch timed out after {0:?}")]
    OriginTimeout(Duration),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message, details) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "Bad request", msg),
            Self::Internal(msg) => {
                tracing::error!("Internal error: {msg}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error",
                    String::new(),
                )
            }
            Self::Upstream { status, details } => {
                tracing::warn!(status = %status, "Origin returned an error status");
                (status, "Upstream error", details)
            }
            Self::OriginUnreachable(msg) => {
                tracing::error!("Origin unreachable: {msg}");
                (StatusCode::BAD_GATEWAY, "Failed to reach API", msg)
            }
            Self::OriginTimeout(after) => {
                tracing::error!(timeout = ?after, "Origin fetch timed out");
                (
                    StatusCode::BAD_GATEWAY,
                    "Failed to reach API",
                    format!("timed out after {}s", after.as_secs_f64()),
                )
            }
        };

        let body = Json(json!({
            "error": error_message,
            "details": details,
        }));

        (status, body).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
