//! Application error type mapping to HTTP status codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use sdlc_core::registry::RegistryError;
use sdlc_types::error::RepositoryError;

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// Errors surfaced by the engine registry.
    Registry(RegistryError),
    /// Validation error.
    Validation(String),
}

impl From<RegistryError> for AppError {
    fn from(e: RegistryError) -> Self {
        AppError::Registry(e)
    }
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::Registry(RegistryError::NotFound(id)) => (
                StatusCode::NOT_FOUND,
                "WORKFLOW_NOT_FOUND",
                format!("Workflow {id} not found"),
            ),
            AppError::Registry(RegistryError::AlreadyTerminal(id)) => (
                StatusCode::CONFLICT,
                "WORKFLOW_TERMINAL",
                format!("Workflow {id} has already finished"),
            ),
            AppError::Registry(RegistryError::AlreadyRunning(id)) => (
                StatusCode::CONFLICT,
                "WORKFLOW_RUNNING",
                format!("Workflow {id} is already running"),
            ),
            AppError::Registry(RegistryError::NotRunning(id)) => (
                StatusCode::CONFLICT,
                "WORKFLOW_NOT_RUNNING",
                format!("Workflow {id} is not running on this server"),
            ),
            AppError::Registry(RegistryError::Store(RepositoryError::Connection)) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "CHECKPOINT_UNAVAILABLE",
                "Checkpoint store unavailable".to_string(),
            ),
            AppError::Registry(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                e.to_string(),
            ),
            AppError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        if status.is_server_error() {
            tracing::error!(code, "{message}");
        }

        let body = json!({
            "errors": [{
                "code": code,
                "message": message,
            }],
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        (
            status,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}
