//! Axum router configuration with middleware.
//!
//! Middleware: CORS (open), request tracing.

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::AppState;

/// Build the complete router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(root))
        .route(
            "/workflows",
            post(handlers::workflow::create_workflow).get(handlers::workflow::list_workflows),
        )
        .route("/workflows/{id}", get(handlers::workflow::get_workflow))
        .route(
            "/workflows/{id}/artifacts",
            get(handlers::workflow::get_artifacts),
        )
        .route(
            "/workflows/{id}/cancel",
            post(handlers::workflow::cancel_workflow),
        )
        .route(
            "/workflows/{id}/history",
            get(handlers::workflow::get_history),
        )
        .route("/ws/{id}", get(handlers::ws::workflow_ws))
        .route("/health", get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn root() -> Json<Value> {
    Json(json!({
        "message": "SDLC workflow API",
        "status": "active",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /health - Liveness plus the number of running workflows.
///
/// Reports `degraded` when the checkpoint store cannot be listed.
async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let (status, known) = match state.registry.list().await {
        Ok(workflows) => ("healthy", Some(workflows.len())),
        Err(err) => {
            tracing::warn!(error = %err, "health check could not list workflows");
            ("degraded", None)
        }
    };
    Json(json!({
        "status": status,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "active_workflows": state.registry.active_count(),
        "known_workflows": known,
    }))
}
