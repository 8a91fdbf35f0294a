//! Workflow handlers: submit, inspect, list, cancel.

use std::collections::HashMap;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use sdlc_types::workflow::{
    CheckpointRecord, FailureReason, Stage, WorkflowState, WorkflowSummary,
};

use crate::http::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateWorkflowRequest {
    pub project_idea: String,
    #[serde(default)]
    pub metadata: Option<HashMap<String, Value>>,
}

#[derive(Debug, Serialize)]
pub struct CreateWorkflowResponse {
    pub workflow_id: Uuid,
    pub status: &'static str,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct WorkflowStatusResponse {
    pub workflow_id: Uuid,
    pub status: Stage,
    pub completed_stages: Vec<Stage>,
    pub artifacts_count: usize,
    pub error_count: u32,
    pub requires_escalation: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    pub updated_at: DateTime<Utc>,
}

impl From<&WorkflowState> for WorkflowStatusResponse {
    fn from(state: &WorkflowState) -> Self {
        Self {
            workflow_id: state.workflow_id,
            status: state.current_stage,
            completed_stages: state.completed_stages(),
            artifacts_count: state.artifacts.len(),
            error_count: state.error_count,
            requires_escalation: state.requires_escalation,
            failure_reason: state.failure_reason,
            updated_at: state.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListWorkflowsResponse {
    pub workflows: Vec<WorkflowSummary>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct ArtifactsResponse {
    pub workflow_id: Uuid,
    pub artifacts: HashMap<String, Value>,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub workflow_id: Uuid,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub workflow_id: Uuid,
    pub checkpoints: Vec<CheckpointRecord>,
    pub total: usize,
}

/// POST /workflows - Create a workflow and start driving it.
pub async fn create_workflow(
    State(state): State<AppState>,
    Json(body): Json<CreateWorkflowRequest>,
) -> Result<Json<CreateWorkflowResponse>, AppError> {
    let project_idea = body.project_idea.trim();
    if project_idea.is_empty() {
        return Err(AppError::Validation("project_idea must not be empty".to_string()));
    }

    let workflow = state
        .registry
        .submit(project_idea, body.metadata.unwrap_or_default())
        .await?;

    Ok(Json(CreateWorkflowResponse {
        workflow_id: workflow.workflow_id,
        status: "started",
        message: format!("Workflow started for: {}", workflow.project_idea),
        created_at: workflow.created_at,
    }))
}

/// GET /workflows/{id} - Last durable state of a workflow.
pub async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<WorkflowStatusResponse>, AppError> {
    let workflow = state.registry.status(id).await?;
    Ok(Json(WorkflowStatusResponse::from(&workflow)))
}

/// GET /workflows - Summaries of every known workflow.
pub async fn list_workflows(
    State(state): State<AppState>,
) -> Result<Json<ListWorkflowsResponse>, AppError> {
    let workflows = state.registry.list().await?;
    Ok(Json(ListWorkflowsResponse {
        total: workflows.len(),
        workflows,
    }))
}

/// GET /workflows/{id}/artifacts - Accumulated artifacts.
pub async fn get_artifacts(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ArtifactsResponse>, AppError> {
    let workflow = state.registry.status(id).await?;
    Ok(Json(ArtifactsResponse {
        workflow_id: id,
        artifacts: workflow.artifacts,
    }))
}

/// POST /workflows/{id}/cancel - Stop after the current stage.
pub async fn cancel_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<CancelResponse>), AppError> {
    state.registry.cancel(id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(CancelResponse {
            workflow_id: id,
            status: "cancelling",
        }),
    ))
}

/// GET /workflows/{id}/history - Full checkpoint history.
pub async fn get_history(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<HistoryResponse>, AppError> {
    let checkpoints = state.registry.history(id).await?;
    Ok(Json(HistoryResponse {
        workflow_id: id,
        total: checkpoints.len(),
        checkpoints,
    }))
}
