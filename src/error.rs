use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AppError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("no route: {0}")]
    NoRoute(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Short machine-readable name, used as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::InvalidInput(_) => "invalid_input",
            AppError::InvalidTransition(_) => "invalid_transition",
            AppError::Forbidden(_) => "forbidden",
            AppError::Conflict(_) => "conflict",
            AppError::NotFound(_) => "not_found",
            AppError::Timeout(_) => "timeout",
            AppError::Unavailable(_) => "unavailable",
            AppError::PermissionDenied(_) => "permission_denied",
            AppError::NoRoute(_) => "no_route",
            AppError::Internal(_) => "internal",
        }
    }
}

/// Failure reported by a location sensor callback.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SensorError {
    #[error("location permission denied")]
    PermissionDenied,

    #[error("location unavailable")]
    Unavailable,

    #[error("location request timed out")]
    Timeout,
}

impl From<SensorError> for AppError {
    fn from(err: SensorError) -> Self {
        match err {
            SensorError::PermissionDenied => AppError::PermissionDenied(err.to_string()),
            SensorError::Unavailable => AppError::Unavailable(err.to_string()),
            SensorError::Timeout => AppError::Timeout(err.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::InvalidTransition(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            AppError::NoRoute(_) => StatusCode::BAD_GATEWAY,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.to_string(),
            "kind": self.kind(),
        }));

        (status, body).into_response()
    }
}
