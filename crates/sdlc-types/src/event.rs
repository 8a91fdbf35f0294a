//! Step events for the per-workflow event stream.
//!
//! `StepEvent` is the tagged event type broadcast by the workflow engine after
//! every durable transition. All variants are Clone + Send + Sync for use with
//! tokio broadcast channels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::{CheckpointRecord, DecisionLabel, FailureReason, Stage};

/// Events emitted while a workflow advances through the stage graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepEvent {
    /// A stage ran and its transition was durably checkpointed as `sequence`.
    Transition {
        workflow_id: Uuid,
        sequence: u64,
        from_stage: Stage,
        to_stage: Stage,
        outcome_summary: OutcomeSummary,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// The workflow failed without a durable checkpoint for the final step.
    Aborted {
        workflow_id: Uuid,
        from_stage: Stage,
        reason: FailureReason,
        timestamp: DateTime<Utc>,
    },
}

/// Compact description of the outcome that produced a transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeSummary {
    pub success: bool,
    /// Edge label taken. `None` for transitions forced outside the graph
    /// (cancellation, missing executor).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<DecisionLabel>,
    pub attempt: u32,
    pub error_count: u32,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub requires_escalation: bool,
}

impl StepEvent {
    /// Checkpoint sequence this event corresponds to (`None` for aborts).
    pub fn sequence(&self) -> Option<u64> {
        match self {
            StepEvent::Transition { sequence, .. } => Some(*sequence),
            StepEvent::Aborted { .. } => None,
        }
    }

    /// Whether no further events will follow for this workflow.
    pub fn is_terminal(&self) -> bool {
        match self {
            StepEvent::Transition { to_stage, .. } => to_stage.is_terminal(),
            StepEvent::Aborted { .. } => true,
        }
    }

    /// Rebuild the transition event a checkpoint was published with.
    ///
    /// Returns `None` for the initial submission record, which carries no
    /// stage result.
    pub fn from_record(record: &CheckpointRecord) -> Option<Self> {
        let state = &record.state;
        let last = state.stage_results.last()?;

        let error = if !last.errors.is_empty() {
            Some(last.errors.join("; "))
        } else {
            state.failure_reason.map(|r| r.to_string())
        };

        Some(StepEvent::Transition {
            workflow_id: record.workflow_id,
            sequence: record.sequence,
            from_stage: last.stage,
            to_stage: state.current_stage,
            outcome_summary: OutcomeSummary {
                success: last.success,
                decision: last.decision,
                attempt: last.attempt,
                error_count: state.error_count,
                artifacts: last.artifacts.clone(),
                requires_escalation: last.requires_escalation,
            },
            error,
            timestamp: record.recorded_at,
        })
    }
}
