//! Built-in stage executor used when no external command is configured.

use sdlc_core::stage::{ExecutorRegistry, StageExecutor};
use sdlc_types::error::StageError;
use sdlc_types::workflow::{Stage, StageOutcome, WorkflowState};
use serde_json::json;

/// Always succeeds with a `<stage>_report` artifact describing the stage.
#[derive(Debug, Clone, Copy)]
pub struct PlaceholderStage;

impl StageExecutor for PlaceholderStage {
    fn name(&self) -> &str {
        "placeholder"
    }

    async fn execute(&self, state: &WorkflowState) -> Result<StageOutcome, StageError> {
        let stage = state.current_stage;
        tracing::debug!(workflow_id = %state.workflow_id, %stage, "placeholder stage");

        Ok(StageOutcome::success().with_artifact(
            format!("{stage}_report"),
            json!({
                "stage": stage,
                "project_idea": state.project_idea,
                "attempt": state.invocations(stage) + 1,
            }),
        ))
    }
}

/// Every executable stage backed by [`PlaceholderStage`].
pub fn placeholder_registry() -> ExecutorRegistry {
    Stage::EXECUTABLE
        .into_iter()
        .fold(ExecutorRegistry::new(), |registry, stage| {
            registry.with(stage, PlaceholderStage)
        })
}
