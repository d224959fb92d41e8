//! Error taxonomy shared across every component of the control plane.
//!
//! Handlers return `AppError`; the HTTP surface maps each variant to a status
//! code and a stable `error_code` string (§7). Internal failures are logged
//! with a correlation id and never echoed to the caller.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("authentication required")]
    Auth,

    #[error("permission denied")]
    Permission,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("rate limited")]
    RateLimited { retry_after_secs: u64 },

    #[error("circuit open for {0}")]
    CircuitOpen(String),

    #[error("upstream unavailable: {0}")]
    TransientUpstream(String),

    #[error("operation timed out")]
    Timeout,

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation_error",
            AppError::Auth => "auth_error",
            AppError::Permission => "permission_error",
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::RateLimited { .. } => "rate_limited",
            AppError::CircuitOpen(_) => "circuit_open",
            AppError::TransientUpstream(_) => "transient_upstream",
            AppError::Timeout => "timeout",
            AppError::Internal(_) => "internal_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Auth => StatusCode::UNAUTHORIZED,
            AppError::Permission => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::CircuitOpen(_) | AppError::TransientUpstream(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let correlation_id = Uuid::new_v4();

        // AuthError and PermissionError must never be distinguished in the
        // response body; Internal errors are logged but never echoed.
        let message = match &self {
            AppError::Auth | AppError::Permission => "authentication or permission failure".to_string(),
            AppError::Internal(e) => {
                tracing::error!(correlation_id = %correlation_id, error = %e, "internal error");
                "internal error".to_string()
            }
            other => other.to_string(),
        };

        let mut body = json!({
            "error_code": self.error_code(),
            "message": message,
            "correlation_id": correlation_id.to_string(),
        });

        if let AppError::RateLimited { retry_after_secs } = &self {
            body["retry_after"] = json!(retry_after_secs);
        }

        let mut response = (status, Json(body)).into_response();
        if let AppError::RateLimited { retry_after_secs } = &self {
            if let Ok(v) = axum::http::HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert("Retry-After", v);
            }
        }
        response
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Errors never distinguished in the response: wraps an auth-or-permission
/// failure so call sites don't have to choose which at the boundary.
pub fn auth_or_permission(authenticated: bool) -> AppError {
    if authenticated {
        AppError::Permission
    } else {
        AppError::Auth
    }
}
