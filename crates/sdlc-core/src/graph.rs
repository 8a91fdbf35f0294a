//! Stage graph: static topology plus the branch decision function.
//!
//! Every executable stage has exactly one outgoing rule. Most stages have a
//! fixed successor; the branch stage chooses between escalate, retry and
//! continue targets after its outcome has been merged into state. Graph
//! validation uses `petgraph` to check that every stage reachable from the
//! entry can still reach `completed`.

use std::collections::BTreeMap;

use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use sdlc_types::config::EngineConfig;
use sdlc_types::workflow::{DecisionLabel, FailureReason, Stage, StageEdge, WorkflowState};

// ---------------------------------------------------------------------------
// Topology
// ---------------------------------------------------------------------------

/// Outgoing rule of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Successor {
    Fixed(Stage),
    Branch(BranchTargets),
}

/// Targets of a branch stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchTargets {
    pub escalate: Stage,
    pub retry: Stage,
    pub cont: Stage,
}

/// Static description of stages and their successor edges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageGraph {
    entry: Stage,
    successors: BTreeMap<Stage, Successor>,
}

impl StageGraph {
    /// An empty graph starting at `entry`.
    pub fn new(entry: Stage) -> Self {
        Self {
            entry,
            successors: BTreeMap::new(),
        }
    }

    /// The SDLC pipeline: a linear chain with one branch at
    /// `junior_development`.
    pub fn sdlc() -> Self {
        Self::new(Stage::MarketValidation)
            .with_edge(Stage::MarketValidation, Stage::SolutionArchitecture)
            .with_edge(Stage::SolutionArchitecture, Stage::ProductManagement)
            .with_edge(Stage::ProductManagement, Stage::SoftwareArchitecture)
            .with_edge(Stage::SoftwareArchitecture, Stage::JuniorDevelopment)
            .with_branch(
                Stage::JuniorDevelopment,
                BranchTargets {
                    escalate: Stage::SeniorDevelopment,
                    retry: Stage::JuniorDevelopment,
                    cont: Stage::QualityAssurance,
                },
            )
            .with_edge(Stage::SeniorDevelopment, Stage::QualityAssurance)
            .with_edge(Stage::QualityAssurance, Stage::Deployment)
            .with_edge(Stage::Deployment, Stage::Completed)
    }

    pub fn with_edge(mut self, from: Stage, to: Stage) -> Self {
        self.successors.insert(from, Successor::Fixed(to));
        self
    }

    pub fn with_branch(mut self, from: Stage, targets: BranchTargets) -> Self {
        self.successors.insert(from, Successor::Branch(targets));
        self
    }

    pub fn entry(&self) -> Stage {
        self.entry
    }

    pub fn successor(&self, stage: Stage) -> Option<&Successor> {
        self.successors.get(&stage)
    }

    /// Whether `stage` is a node of this graph or a terminal sentinel.
    pub fn contains(&self, stage: Stage) -> bool {
        stage.is_terminal() || stage == Stage::Start || self.successors.contains_key(&stage)
    }

    pub fn is_branch(&self, stage: Stage) -> bool {
        matches!(self.successors.get(&stage), Some(Successor::Branch(_)))
    }

    /// Stages that run an executor, in declaration order.
    pub fn stages(&self) -> Vec<Stage> {
        self.successors.keys().copied().collect()
    }

    /// Every labelled edge, including the implicit `exhausted -> failed` edge
    /// of each branch stage.
    pub fn edges(&self) -> Vec<StageEdge> {
        let mut edges = Vec::new();
        for (&from, successor) in &self.successors {
            match *successor {
                Successor::Fixed(to) => edges.push(StageEdge {
                    from,
                    label: DecisionLabel::Next,
                    to,
                }),
                Successor::Branch(t) => {
                    for (label, to) in [
                        (DecisionLabel::Escalate, t.escalate),
                        (DecisionLabel::Retry, t.retry),
                        (DecisionLabel::Continue, t.cont),
                        (DecisionLabel::Exhausted, Stage::Failed),
                    ] {
                        edges.push(StageEdge { from, label, to });
                    }
                }
            }
        }
        edges
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    /// Check the topology is usable by the engine.
    ///
    /// - the entry has a successor rule
    /// - no sentinel has a successor rule
    /// - every edge target is a known stage or a terminal sentinel
    /// - every stage reachable from the entry can reach `completed`
    pub fn validate(&self) -> Result<(), GraphError> {
        if !self.successors.contains_key(&self.entry) {
            return Err(GraphError::UnknownStage(format!(
                "entry stage '{}' has no successor rule",
                self.entry
            )));
        }

        let mut graph = DiGraph::<Stage, DecisionLabel>::new();
        let mut nodes: BTreeMap<Stage, NodeIndex> = BTreeMap::new();
        for stage in self.successors.keys().copied().chain([Stage::Completed, Stage::Failed]) {
            if !stage.is_executable() && self.successors.contains_key(&stage) {
                return Err(GraphError::InvalidNode(format!(
                    "sentinel '{stage}' cannot have a successor rule"
                )));
            }
            nodes.insert(stage, graph.add_node(stage));
        }

        for edge in self.edges() {
            let to = nodes.get(&edge.to).copied().ok_or_else(|| {
                GraphError::UnknownStage(format!(
                    "'{}' --{}--> unknown stage '{}'",
                    edge.from, edge.label, edge.to
                ))
            })?;
            graph.add_edge(nodes[&edge.from], to, edge.label);
        }

        let entry = nodes[&self.entry];
        let completed = nodes[&Stage::Completed];
        for (&stage, &idx) in &nodes {
            if !stage.is_executable() || !has_path_connecting(&graph, entry, idx, None) {
                continue;
            }
            if !has_path_connecting(&graph, idx, completed, None) {
                return Err(GraphError::NoPathToCompletion(format!(
                    "stage '{stage}' cannot reach completed"
                )));
            }
        }

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Decision
    // -----------------------------------------------------------------------

    /// Decide where `stage` goes next, given the state after its outcome
    /// has been merged.
    ///
    /// Pure: the caller applies the returned decision with
    /// [`Decision::apply`].
    pub fn decide(
        &self,
        stage: Stage,
        state: &WorkflowState,
        policy: &BranchPolicy,
    ) -> Result<Decision, GraphError> {
        let successor = self
            .successors
            .get(&stage)
            .ok_or_else(|| GraphError::UnknownStage(format!("no successor rule for '{stage}'")))?;

        let decision = match *successor {
            Successor::Fixed(to) => Decision::new(stage, DecisionLabel::Next, to),
            Successor::Branch(targets) => {
                let over_threshold = state.error_count > policy.retry_threshold;
                let attempts = state.attempts(stage);

                if state.requires_escalation {
                    Decision::new(stage, DecisionLabel::Escalate, targets.escalate)
                } else if over_threshold && attempts < policy.max_attempts {
                    Decision::new(stage, DecisionLabel::Retry, targets.retry)
                } else if over_threshold {
                    Decision {
                        from: stage,
                        label: DecisionLabel::Exhausted,
                        to: Stage::Failed,
                        failure: Some(FailureReason::RetryLimitExceeded),
                    }
                } else {
                    Decision::new(stage, DecisionLabel::Continue, targets.cont)
                }
            }
        };

        Ok(decision)
    }
}

impl Default for StageGraph {
    fn default() -> Self {
        Self::sdlc()
    }
}

/// Thresholds the branch decision reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchPolicy {
    pub retry_threshold: u32,
    pub max_attempts: u32,
    pub reset_errors_on_success: bool,
}

impl From<&EngineConfig> for BranchPolicy {
    fn from(config: &EngineConfig) -> Self {
        Self {
            retry_threshold: config.retry_threshold,
            max_attempts: config.max_attempts,
            reset_errors_on_success: config.reset_errors_on_success,
        }
    }
}

impl Default for BranchPolicy {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

/// Outcome of the decision function for one transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub from: Stage,
    pub label: DecisionLabel,
    pub to: Stage,
    pub failure: Option<FailureReason>,
}

impl Decision {
    fn new(from: Stage, label: DecisionLabel, to: Stage) -> Self {
        Self {
            from,
            label,
            to,
            failure: None,
        }
    }

    /// Move `state` along this decision's edge.
    ///
    /// Escalation clears the flag; a retry bumps the branch stage's attempt
    /// count by exactly one.
    pub fn apply(&self, state: &mut WorkflowState) {
        match self.label {
            DecisionLabel::Escalate => state.requires_escalation = false,
            DecisionLabel::Retry => {
                *state.attempt_counts.entry(self.from).or_insert(0) += 1;
            }
            _ => {}
        }
        if let Some(reason) = self.failure {
            state.failure_reason = Some(reason);
        }
        state.current_stage = self.to;
    }
}

// ---------------------------------------------------------------------------
// GraphError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("unknown stage: {0}")]
    UnknownStage(String),

    #[error("invalid node: {0}")]
    InvalidNode(String),

    #[error("no path to completion: {0}")]
    NoPathToCompletion(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
