//! Workflow domain types for the SDLC orchestrator.
//!
//! `WorkflowState` is the unit of progress for one pipeline run. It flows
//! forward through the stage graph, is extended (never rewritten) by each
//! stage outcome, and is persisted as a `CheckpointRecord` after every
//! transition.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// A node of the stage graph, or one of the lifecycle sentinels.
///
/// `Start` is the position of a freshly submitted workflow. `Completed` and
/// `Failed` are terminal: once reached, no further stage executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Start,
    MarketValidation,
    SolutionArchitecture,
    ProductManagement,
    SoftwareArchitecture,
    JuniorDevelopment,
    SeniorDevelopment,
    QualityAssurance,
    Deployment,
    Completed,
    Failed,
}

impl Stage {
    /// Every stage backed by an executor, in pipeline order.
    pub const EXECUTABLE: [Stage; 8] = [
        Stage::MarketValidation,
        Stage::SolutionArchitecture,
        Stage::ProductManagement,
        Stage::SoftwareArchitecture,
        Stage::JuniorDevelopment,
        Stage::SeniorDevelopment,
        Stage::QualityAssurance,
        Stage::Deployment,
    ];

    /// Canonical snake_case name, identical to the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Start => "start",
            Stage::MarketValidation => "market_validation",
            Stage::SolutionArchitecture => "solution_architecture",
            Stage::ProductManagement => "product_management",
            Stage::SoftwareArchitecture => "software_architecture",
            Stage::JuniorDevelopment => "junior_development",
            Stage::SeniorDevelopment => "senior_development",
            Stage::QualityAssurance => "quality_assurance",
            Stage::Deployment => "deployment",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
        }
    }

    /// Whether this is `Completed` or `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed)
    }

    /// Whether this stage runs an executor (i.e. is not a sentinel).
    pub fn is_executable(&self) -> bool {
        !matches!(self, Stage::Start | Stage::Completed | Stage::Failed)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Stage::Start),
            "market_validation" => Ok(Stage::MarketValidation),
            "solution_architecture" => Ok(Stage::SolutionArchitecture),
            "product_management" => Ok(Stage::ProductManagement),
            "software_architecture" => Ok(Stage::SoftwareArchitecture),
            "junior_development" => Ok(Stage::JuniorDevelopment),
            "senior_development" => Ok(Stage::SeniorDevelopment),
            "quality_assurance" => Ok(Stage::QualityAssurance),
            "deployment" => Ok(Stage::Deployment),
            "completed" => Ok(Stage::Completed),
            "failed" => Ok(Stage::Failed),
            other => Err(format!("unknown stage: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Branch decisions and edges
// ---------------------------------------------------------------------------

/// Label on an outgoing edge of the stage graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionLabel {
    /// The single fixed successor of a non-branch stage.
    Next,
    /// Route to the higher-capability remediation stage.
    Escalate,
    /// Re-run the branch stage.
    Retry,
    /// Proceed along the happy path.
    Continue,
    /// Retry bound exhausted while still over the error threshold.
    Exhausted,
}

impl DecisionLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionLabel::Next => "next",
            DecisionLabel::Escalate => "escalate",
            DecisionLabel::Retry => "retry",
            DecisionLabel::Continue => "continue",
            DecisionLabel::Exhausted => "exhausted",
        }
    }
}

impl fmt::Display for DecisionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `(from_stage, decision_label) -> to_stage`: one edge of the static topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StageEdge {
    pub from: Stage,
    pub label: DecisionLabel,
    pub to: Stage,
}

// ---------------------------------------------------------------------------
// Failure reasons
// ---------------------------------------------------------------------------

/// Why a workflow ended in `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The branch stage kept failing past the configured attempt bound.
    RetryLimitExceeded,
    /// The checkpoint store could not durably persist a transition.
    CheckpointUnavailable,
    /// An operator requested cancellation.
    Cancelled,
    /// No executor was registered for the stage about to run.
    ExecutorMissing,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::RetryLimitExceeded => "retry_limit_exceeded",
            FailureReason::CheckpointUnavailable => "checkpoint_unavailable",
            FailureReason::Cancelled => "cancelled",
            FailureReason::ExecutorMissing => "executor_missing",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Stage outcome (executor delta)
// ---------------------------------------------------------------------------

/// The delta a stage executor returns. The engine merges it into state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub success: bool,
    /// Artifacts produced by the stage, keyed by artifact name.
    #[serde(default)]
    pub artifacts: HashMap<String, Value>,
    /// Error messages, in the order they occurred.
    #[serde(default)]
    pub errors: Vec<String>,
    /// The stage cannot proceed on its own and asks for escalation.
    #[serde(default)]
    pub requires_escalation: bool,
}

impl StageOutcome {
    /// A successful outcome with no artifacts.
    pub fn success() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    /// A failed outcome carrying the given errors.
    pub fn failure<I, S>(errors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            success: false,
            errors: errors.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Add an artifact (builder style).
    pub fn with_artifact(mut self, name: impl Into<String>, content: Value) -> Self {
        self.artifacts.insert(name.into(), content);
        self
    }

    /// Set the escalation flag (builder style).
    pub fn escalate(mut self) -> Self {
        self.requires_escalation = true;
        self
    }
}

// ---------------------------------------------------------------------------
// Stage result (history entry)
// ---------------------------------------------------------------------------

/// One append-only entry in `WorkflowState::stage_results`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: Stage,
    pub success: bool,
    /// 1-based invocation number of this stage within the run.
    pub attempt: u32,
    /// Names of the artifacts this stage produced.
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub requires_escalation: bool,
    /// Set when the outcome was discarded because of cancellation.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
    /// Edge taken after this result was merged. `None` when the transition
    /// was forced outside the graph.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<DecisionLabel>,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Workflow state
// ---------------------------------------------------------------------------

/// The versioned, append-only record that flows through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    /// Assigned at creation, never changes.
    pub workflow_id: Uuid,
    /// Sequence number of the checkpoint this snapshot was written as
    /// (0 until the first append).
    pub version: u64,
    /// Free-form input idea, immutable after creation.
    pub project_idea: String,
    /// Caller-supplied metadata, immutable after creation.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
    pub current_stage: Stage,
    pub stage_results: Vec<StageResult>,
    /// Every error message reported so far, in order.
    #[serde(default)]
    pub errors: Vec<String>,
    pub error_count: u32,
    pub requires_escalation: bool,
    /// Accumulated artifacts; a later stage overwrites a same-named one.
    #[serde(default)]
    pub artifacts: HashMap<String, Value>,
    /// Retry attempts per stage within this run.
    #[serde(default)]
    pub attempt_counts: HashMap<Stage, u32>,
    /// Snapshot of `artifacts` taken by the step that reached `completed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_artifacts: Option<HashMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    /// Create the initial state for a new submission, positioned at `start`.
    pub fn new(project_idea: impl Into<String>, metadata: HashMap<String, Value>) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: Uuid::now_v7(),
            version: 0,
            project_idea: project_idea.into(),
            metadata,
            current_stage: Stage::Start,
            stage_results: Vec::new(),
            errors: Vec::new(),
            error_count: 0,
            requires_escalation: false,
            artifacts: HashMap::new(),
            attempt_counts: HashMap::new(),
            final_artifacts: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.current_stage.is_terminal()
    }

    /// Retry attempts recorded for `stage` (0 if none).
    pub fn attempts(&self, stage: Stage) -> u32 {
        self.attempt_counts.get(&stage).copied().unwrap_or(0)
    }

    /// How many times `stage` has been executed in this run.
    pub fn invocations(&self, stage: Stage) -> u32 {
        self.stage_results.iter().filter(|r| r.stage == stage).count() as u32
    }

    /// Stages with at least one successful result, in first-success order.
    pub fn completed_stages(&self) -> Vec<Stage> {
        let mut stages = Vec::new();
        for result in self.stage_results.iter().filter(|r| r.success) {
            if !stages.contains(&result.stage) {
                stages.push(result.stage);
            }
        }
        stages
    }

    /// Compact listing view.
    pub fn summary(&self) -> WorkflowSummary {
        WorkflowSummary {
            workflow_id: self.workflow_id,
            project_idea: self.project_idea.clone(),
            current_stage: self.current_stage,
            completed_stages: self.completed_stages().len(),
            error_count: self.error_count,
            failure_reason: self.failure_reason,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Listing row for the registry and the front door.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub workflow_id: Uuid,
    pub project_idea: String,
    pub current_stage: Stage,
    pub completed_stages: usize,
    pub error_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Checkpoint record
// ---------------------------------------------------------------------------

/// `(workflow_id, sequence_number, WorkflowState snapshot)`.
///
/// `sequence` is strictly increasing and gapless per workflow, starting at 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub workflow_id: Uuid,
    pub sequence: u64,
    pub state: WorkflowState,
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
