//! HTTP error responses.
//!
//! Handlers fail with [`ApiError`], a status plus a `{code, message}` body.
//! Errors from the auth and identity layers convert here so every endpoint
//! reports the same cause the same way. Details stay in the logs: login
//! failures all read `invalid credentials` and internal errors carry only the
//! code the caller passed in.
use crate::api::types::ErrorResponse;
use crate::auth::manager::AuthError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use sessionplane_identity::LookupError;

/// Body of every rejected login, whichever provider said no.
pub const LOGIN_FAILED: &str = "invalid credentials";

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorResponse {
                code: code.to_string(),
                message: message.into(),
            },
        }
    }

    pub fn code(&self) -> &str {
        &self.body.code
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::FederatedNotConfigured => api_not_enabled("single sign-on is not configured"),
            AuthError::Token(err) => api_internal("token_error", "failed to issue session", &err),
            AuthError::InvalidSession(err) => {
                tracing::debug!(error = %err, "session rejected");
                api_unauthorized("session invalid or expired")
            }
            other => {
                tracing::debug!(error = %other, "login rejected");
                api_unauthorized(LOGIN_FAILED)
            }
        }
    }
}

/// Cluster reads on behalf of a caller. A missing object is the caller's
/// problem; anything else means this service lacks access or the API server
/// is struggling.
impl From<LookupError> for ApiError {
    fn from(err: LookupError) -> Self {
        match err {
            LookupError::NotFound => api_not_found("resource not found"),
            LookupError::Conflict => api_conflict(
                "concurrent_update",
                "resource changed while it was being updated; retry",
            ),
            err => api_internal("cluster_error", "cluster request failed", &err),
        }
    }
}

/// Disabled features answer 404 so their presence is not advertised.
pub fn api_not_enabled(message: &str) -> ApiError {
    ApiError::new(StatusCode::NOT_FOUND, "not_enabled", message)
}

pub fn api_not_found(message: &str) -> ApiError {
    ApiError::new(StatusCode::NOT_FOUND, "not_found", message)
}

pub fn api_conflict(code: &str, message: &str) -> ApiError {
    ApiError::new(StatusCode::CONFLICT, code, message)
}

/// 500 with a caller-chosen code. `err` is logged, never returned.
pub fn api_internal(code: &str, message: &str, err: &dyn std::fmt::Display) -> ApiError {
    tracing::error!(error = %err, code, "request failed");
    ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, code, message)
}

pub fn api_unauthorized(message: &str) -> ApiError {
    ApiError::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
}

pub fn api_forbidden(message: &str) -> ApiError {
    ApiError::new(StatusCode::FORBIDDEN, "forbidden", message)
}

pub fn api_validation_error(message: &str) -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, "validation_error", message)
}
