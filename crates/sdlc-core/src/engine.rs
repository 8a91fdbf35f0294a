//! Workflow engine: drives one workflow through the stage graph.
//!
//! # Step
//!
//! 1. Look up the executor for `current_stage`.
//! 2. Invoke it (timeout + panic containment), folding faults into a failed outcome.
//! 3. Merge the outcome into state and append a `StageResult`.
//! 4. Apply the branch decision (or the fixed successor).
//! 5. Durably append a checkpoint, retrying with exponential backoff.
//! 6. Only then publish the `StepEvent` and the new durable state.
//!
//! Cancellation is cooperative: it is polled between stages and after an
//! executor returns, never while one is running.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::FutureExt;
use sdlc_types::config::EngineConfig;
use sdlc_types::error::{RepositoryError, StageError};
use sdlc_types::event::StepEvent;
use sdlc_types::workflow::{
    CheckpointRecord, FailureReason, Stage, StageOutcome, StageResult, WorkflowState,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::CheckpointStore;
use crate::event::EventBus;
use crate::graph::{BranchPolicy, GraphError, StageGraph};
use crate::stage::{BoxStageExecutor, ExecutorRegistry};

// ---------------------------------------------------------------------------
// Run context and exit
// ---------------------------------------------------------------------------

/// Per-workflow channels the driver loop reports through.
pub struct RunContext {
    pub cancel: CancellationToken,
    pub events: EventBus,
    /// Latest durably checkpointed state.
    pub durable: watch::Sender<WorkflowState>,
    /// Set before the `aborted` event is published.
    pub aborted: OnceLock<FailureReason>,
}

impl RunContext {
    pub fn new(initial: WorkflowState, event_buffer: usize) -> Self {
        let (durable, _) = watch::channel(initial);
        Self {
            cancel: CancellationToken::new(),
            events: EventBus::new(event_buffer),
            durable,
            aborted: OnceLock::new(),
        }
    }
}

/// How a driver loop ended.
#[derive(Debug, Clone)]
pub enum EngineExit {
    /// Reached `completed` or `failed`, durably checkpointed.
    Finished(WorkflowState),
    /// Could not persist a transition; the last durable state is older
    /// than `state`.
    Aborted {
        state: WorkflowState,
        reason: FailureReason,
    },
    /// Another driver appended first; this one stopped without writing.
    Superseded(WorkflowState),
}

impl EngineExit {
    pub fn state(&self) -> &WorkflowState {
        match self {
            EngineExit::Finished(state)
            | EngineExit::Aborted { state, .. }
            | EngineExit::Superseded(state) => state,
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Drives workflow state machines. One engine is shared by every workflow;
/// each `run` call owns its own state.
pub struct WorkflowEngine<S: CheckpointStore> {
    store: Arc<S>,
    executors: Arc<ExecutorRegistry>,
    graph: Arc<StageGraph>,
    policy: BranchPolicy,
    config: EngineConfig,
}

impl<S: CheckpointStore> Clone for WorkflowEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            executors: Arc::clone(&self.executors),
            graph: Arc::clone(&self.graph),
            policy: self.policy,
            config: self.config.clone(),
        }
    }
}

impl<S: CheckpointStore + 'static> WorkflowEngine<S> {
    pub fn new(
        store: Arc<S>,
        executors: Arc<ExecutorRegistry>,
        graph: Arc<StageGraph>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            executors,
            graph,
            policy: BranchPolicy::from(&config),
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Durably record a fresh submission as sequence 1.
    pub async fn persist_initial(&self, state: &mut WorkflowState) -> Result<u64, EngineError> {
        state.version = 0;
        self.append_with_retry(state).await
    }

    /// Run the driver loop until the workflow is terminal, aborted or superseded.
    ///
    /// Running against an already terminal state is a no-op: nothing is
    /// written and no event is emitted.
    pub async fn run(
        &self,
        mut state: WorkflowState,
        ctx: &RunContext,
    ) -> Result<EngineExit, EngineError> {
        if state.is_terminal() {
            tracing::debug!(workflow_id = %state.workflow_id, "workflow already terminal");
            return Ok(EngineExit::Finished(state));
        }

        if state.current_stage == Stage::Start {
            state.current_stage = self.graph.entry();
        }
        // A checkpoint written against a different graph cannot be resumed here.
        if !self.graph.contains(state.current_stage) {
            return Err(GraphError::UnknownStage(state.current_stage.to_string()).into());
        }

        tracing::info!(
            workflow_id = %state.workflow_id,
            stage = %state.current_stage,
            version = state.version,
            "driving workflow"
        );

        while !state.is_terminal() {
            let from = state.current_stage;
            let step = if ctx.cancel.is_cancelled() {
                self.cancel_at(&mut state, 0, ctx).await
            } else {
                self.step(&mut state, ctx).await
            };

            match step {
                Ok(()) => {}
                Err(EngineError::StaleCheckpoint(reason)) => {
                    tracing::warn!(
                        workflow_id = %state.workflow_id,
                        %reason,
                        "checkpoint superseded, stopping driver"
                    );
                    return Ok(EngineExit::Superseded(state));
                }
                Err(EngineError::Checkpoint { attempts, source }) => {
                    tracing::error!(
                        workflow_id = %state.workflow_id,
                        stage = %from,
                        attempts,
                        error = %source,
                        "checkpoint unavailable, aborting workflow"
                    );
                    let reason = FailureReason::CheckpointUnavailable;
                    let _ = ctx.aborted.set(reason);
                    ctx.events.publish(StepEvent::Aborted {
                        workflow_id: state.workflow_id,
                        from_stage: from,
                        reason,
                        timestamp: Utc::now(),
                    });
                    return Ok(EngineExit::Aborted { state, reason });
                }
                Err(e) => return Err(e),
            }
        }

        tracing::info!(
            workflow_id = %state.workflow_id,
            stage = %state.current_stage,
            stage_results = state.stage_results.len(),
            "workflow finished"
        );
        Ok(EngineExit::Finished(state))
    }

    /// Execute `current_stage` once and commit the resulting transition.
    pub async fn step(&self, state: &mut WorkflowState, ctx: &RunContext) -> Result<(), EngineError> {
        let stage = state.current_stage;

        let Some(executor) = self.executors.get(stage) else {
            tracing::error!(workflow_id = %state.workflow_id, stage = %stage, "no executor registered");
            let attempt = state.invocations(stage) + 1;
            state.stage_results.push(StageResult {
                stage,
                success: false,
                attempt,
                artifacts: vec![],
                errors: vec![format!("no executor registered for stage '{stage}'")],
                requires_escalation: false,
                cancelled: false,
                decision: None,
                duration_ms: 0,
                completed_at: Utc::now(),
            });
            state.failure_reason = Some(FailureReason::ExecutorMissing);
            state.current_stage = Stage::Failed;
            return self.commit(state, ctx).await;
        };

        let attempt = state.invocations(stage) + 1;
        tracing::debug!(
            workflow_id = %state.workflow_id,
            stage = %stage,
            attempt,
            executor = executor.name(),
            "executing stage"
        );

        let started = Instant::now();
        let outcome = self.invoke(&executor, stage, state).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        if ctx.cancel.is_cancelled() {
            return self.cancel_at(state, duration_ms, ctx).await;
        }

        let success = outcome.success;
        merge_outcome(state, stage, outcome, attempt, duration_ms);

        if success && self.policy.reset_errors_on_success && self.graph.is_branch(stage) {
            state.error_count = 0;
        }

        let decision = self.graph.decide(stage, state, &self.policy)?;
        if let Some(result) = state.stage_results.last_mut() {
            result.decision = Some(decision.label);
        }
        decision.apply(state);

        if state.current_stage == Stage::Completed {
            state.final_artifacts = Some(state.artifacts.clone());
        }

        tracing::info!(
            workflow_id = %state.workflow_id,
            from = %stage,
            to = %state.current_stage,
            decision = %decision.label,
            success,
            error_count = state.error_count,
            "stage transition"
        );

        self.commit(state, ctx).await
    }

    /// Run the executor with a timeout, converting every fault into a
    /// failed outcome.
    async fn invoke(
        &self,
        executor: &BoxStageExecutor,
        stage: Stage,
        state: &WorkflowState,
    ) -> StageOutcome {
        let timeout = Duration::from_secs(self.config.stage_timeout_secs);
        let guarded = AssertUnwindSafe(executor.execute(state)).catch_unwind();

        let fault = match tokio::time::timeout(timeout, guarded).await {
            Ok(Ok(Ok(outcome))) => return outcome,
            Ok(Ok(Err(err))) => err,
            Ok(Err(payload)) => StageError::Panicked(panic_message(payload.as_ref())),
            Err(_) => StageError::Timeout(self.config.stage_timeout_secs),
        };

        tracing::warn!(
            workflow_id = %state.workflow_id,
            stage = %stage,
            error = %fault,
            "executor fault"
        );
        StageOutcome::failure([format!("executor fault: {fault}")])
    }

    /// Record a cancellation for the current stage and commit `failed`.
    async fn cancel_at(
        &self,
        state: &mut WorkflowState,
        duration_ms: u64,
        ctx: &RunContext,
    ) -> Result<(), EngineError> {
        let stage = state.current_stage;
        tracing::info!(workflow_id = %state.workflow_id, stage = %stage, "workflow cancelled");

        state.stage_results.push(StageResult {
            stage,
            success: false,
            attempt: state.invocations(stage) + 1,
            artifacts: vec![],
            errors: vec!["cancelled by operator".to_string()],
            requires_escalation: false,
            cancelled: true,
            decision: None,
            duration_ms,
            completed_at: Utc::now(),
        });
        state.failure_reason = Some(FailureReason::Cancelled);
        state.current_stage = Stage::Failed;
        self.commit(state, ctx).await
    }

    /// Persist the transition, then publish it. Nothing is published unless
    /// the append succeeded.
    async fn commit(&self, state: &mut WorkflowState, ctx: &RunContext) -> Result<(), EngineError> {
        state.updated_at = Utc::now();
        let sequence = self.append_with_retry(state).await?;

        ctx.durable.send_replace(state.clone());

        let record = CheckpointRecord {
            workflow_id: state.workflow_id,
            sequence,
            state: state.clone(),
            recorded_at: state.updated_at,
        };
        if let Some(event) = StepEvent::from_record(&record) {
            ctx.events.publish(event);
        }
        Ok(())
    }

    /// Append `state` as the next checkpoint, retrying transient store
    /// failures with exponential backoff. Bumps `state.version` on success.
    async fn append_with_retry(&self, state: &mut WorkflowState) -> Result<u64, EngineError> {
        let attempts = self.config.checkpoint_retry_attempts.max(1);
        let next_version = state.version + 1;
        let mut candidate = state.clone();
        candidate.version = next_version;

        let mut last_error = RepositoryError::Connection;
        for attempt in 0..attempts {
            match self.store.append(&candidate).await {
                Ok(sequence) => {
                    state.version = sequence;
                    return Ok(sequence);
                }
                Err(RepositoryError::Conflict(reason)) => {
                    return Err(EngineError::StaleCheckpoint(reason));
                }
                Err(e) => {
                    tracing::warn!(
                        workflow_id = %state.workflow_id,
                        version = next_version,
                        attempt = attempt + 1,
                        error = %e,
                        "checkpoint write failed"
                    );
                    last_error = e;
                }
            }

            if attempt + 1 < attempts {
                tokio::time::sleep(backoff_delay(self.config.checkpoint_retry_base_ms, attempt)).await;
            }
        }

        Err(EngineError::Checkpoint {
            attempts,
            source: last_error,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Fold an outcome into state: append-only history, last-write-wins
/// artifacts, accumulated errors.
///
/// A failure counts each reported error, and at least one.
pub fn merge_outcome(
    state: &mut WorkflowState,
    stage: Stage,
    outcome: StageOutcome,
    attempt: u32,
    duration_ms: u64,
) {
    let mut artifact_names: Vec<String> = outcome.artifacts.keys().cloned().collect();
    artifact_names.sort();

    if !outcome.success {
        let increment = u32::try_from(outcome.errors.len()).unwrap_or(u32::MAX).max(1);
        state.error_count = state.error_count.saturating_add(increment);
    }
    state.requires_escalation |= outcome.requires_escalation;
    state.errors.extend(outcome.errors.iter().cloned());
    state.artifacts.extend(outcome.artifacts);

    state.stage_results.push(StageResult {
        stage,
        success: outcome.success,
        attempt,
        artifacts: artifact_names,
        errors: outcome.errors,
        requires_escalation: outcome.requires_escalation,
        cancelled: false,
        decision: None,
        duration_ms,
        completed_at: Utc::now(),
    });
}

/// `base_ms * 2^attempt`, saturating.
fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt.min(20)).unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(factor))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Errors that stop a driver loop.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The graph has no rule for the current stage.
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    /// Checkpoint writes kept failing.
    #[error("checkpoint unavailable after {attempts} attempts: {source}")]
    Checkpoint {
        attempts: u32,
        source: RepositoryError,
    },

    /// The store already holds a newer checkpoint for this workflow.
    #[error("stale checkpoint: {0}")]
    StaleCheckpoint(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;

    use sdlc_types::workflow::DecisionLabel;
    use serde_json::json;

    use super::*;
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::testing::{
        FlakyStore, Hang, Panics, Scripted, Succeed, all_success, drain_events,
    };

    fn engine_with<S: CheckpointStore + 'static>(
        store: Arc<S>,
        executors: ExecutorRegistry,
        config: EngineConfig,
    ) -> WorkflowEngine<S> {
        WorkflowEngine::new(
            store,
            Arc::new(executors),
            Arc::new(StageGraph::sdlc()),
            config,
        )
    }

    async fn submitted<S: CheckpointStore + 'static>(
        engine: &WorkflowEngine<S>,
    ) -> (WorkflowState, RunContext) {
        let mut state = WorkflowState::new("X", HashMap::new());
        engine.persist_initial(&mut state).await.unwrap();
        let ctx = RunContext::new(state.clone(), 64);
        (state, ctx)
    }

    fn transitions(state: &WorkflowState) -> Vec<(Stage, Option<DecisionLabel>)> {
        state
            .stage_results
            .iter()
            .map(|r| (r.stage, r.decision))
            .collect()
    }

    #[tokio::test]
    async fn all_success_completes_along_happy_path() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let engine = engine_with(Arc::clone(&store), all_success(), EngineConfig::default());
        let (state, ctx) = submitted(&engine).await;
        let mut rx = ctx.events.subscribe();

        let exit = engine.run(state, &ctx).await.unwrap();
        let state = exit.state().clone();
        assert!(matches!(exit, EngineExit::Finished(_)));
        assert_eq!(state.current_stage, Stage::Completed);
        // senior_development only runs on escalation
        let happy_path: Vec<Stage> = Stage::EXECUTABLE
            .into_iter()
            .filter(|s| *s != Stage::SeniorDevelopment)
            .collect();
        assert_eq!(state.stage_results.len(), 7);
        assert_eq!(state.completed_stages(), happy_path);
        assert_eq!(state.error_count, 0);

        let final_artifacts = state.final_artifacts.as_ref().unwrap();
        assert_eq!(final_artifacts.len(), 7);
        assert!(final_artifacts.contains_key("deployment_output"));

        let events = drain_events(&mut rx);
        assert_eq!(events.len(), 7);
        let sequences: Vec<u64> = events.iter().filter_map(|e| e.sequence()).collect();
        assert_eq!(sequences, (2..=8).collect::<Vec<u64>>());
        assert!(events.last().unwrap().is_terminal());

        let history = store.history(&state.workflow_id).await.unwrap();
        assert_eq!(history.len(), 8);
        assert_eq!(history[0].state.current_stage, Stage::Start);
        assert_eq!(ctx.durable.borrow().version, 8);
    }

    #[tokio::test]
    async fn rerun_on_terminal_state_is_noop() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let engine = engine_with(Arc::clone(&store), all_success(), EngineConfig::default());
        let (state, ctx) = submitted(&engine).await;
        let finished = engine.run(state, &ctx).await.unwrap().state().clone();

        let mut rx = ctx.events.subscribe();
        let again = engine.run(finished.clone(), &ctx).await.unwrap();
        assert_eq!(again.state(), &finished);
        assert!(drain_events(&mut rx).is_empty());
        assert_eq!(store.history(&finished.workflow_id).await.unwrap().len(), 8);
    }

    #[tokio::test]
    async fn escalation_routes_through_senior() {
        let executors = all_success().with(
            Stage::JuniorDevelopment,
            Scripted::new(vec![StageOutcome::success().escalate()]),
        );
        let engine = engine_with(
            Arc::new(InMemoryCheckpointStore::new()),
            executors,
            EngineConfig::default(),
        );
        let (state, ctx) = submitted(&engine).await;

        let state = engine.run(state, &ctx).await.unwrap().state().clone();
        assert_eq!(state.current_stage, Stage::Completed);
        assert!(!state.requires_escalation);

        let tail: Vec<Stage> = state.stage_results[4..].iter().map(|r| r.stage).collect();
        assert_eq!(
            tail,
            vec![
                Stage::JuniorDevelopment,
                Stage::SeniorDevelopment,
                Stage::QualityAssurance,
                Stage::Deployment,
            ]
        );
        assert_eq!(state.stage_results[4].decision, Some(DecisionLabel::Escalate));
    }

    #[tokio::test]
    async fn retries_until_recovery_then_continues() {
        let failing = StageOutcome::failure(["a", "b", "c", "d"]);
        let junior = Scripted::new(vec![
            failing.clone(),
            failing.clone(),
            failing.clone(),
            failing,
        ]);
        let calls = junior.calls();
        let engine = engine_with(
            Arc::new(InMemoryCheckpointStore::new()),
            all_success().with(Stage::JuniorDevelopment, junior),
            EngineConfig::default(),
        );
        let (state, ctx) = submitted(&engine).await;

        let state = engine.run(state, &ctx).await.unwrap().state().clone();
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(state.current_stage, Stage::Completed);
        assert_eq!(state.attempts(Stage::JuniorDevelopment), 4);
        assert_eq!(state.error_count, 0);
        assert_eq!(state.errors.len(), 16);

        let junior_decisions: Vec<Option<DecisionLabel>> = transitions(&state)
            .into_iter()
            .filter(|(stage, _)| *stage == Stage::JuniorDevelopment)
            .map(|(_, d)| d)
            .collect();
        assert_eq!(
            junior_decisions,
            vec![
                Some(DecisionLabel::Retry),
                Some(DecisionLabel::Retry),
                Some(DecisionLabel::Retry),
                Some(DecisionLabel::Retry),
                Some(DecisionLabel::Continue),
            ]
        );
    }

    #[tokio::test]
    async fn persistent_failure_is_bounded() {
        let junior = Scripted::always(StageOutcome::failure(["e1", "e2", "e3", "e4"]));
        let calls = junior.calls();
        let engine = engine_with(
            Arc::new(InMemoryCheckpointStore::new()),
            all_success().with(Stage::JuniorDevelopment, junior),
            EngineConfig::default(),
        );
        let (state, ctx) = submitted(&engine).await;
        let mut rx = ctx.events.subscribe();

        let state = engine.run(state, &ctx).await.unwrap().state().clone();
        // max_attempts retries plus the first invocation
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert_eq!(state.current_stage, Stage::Failed);
        assert_eq!(state.failure_reason, Some(FailureReason::RetryLimitExceeded));
        assert_eq!(state.attempts(Stage::JuniorDevelopment), 5);
        assert!(state.final_artifacts.is_none());

        let last = drain_events(&mut rx).pop().unwrap();
        assert!(matches!(
            last,
            StepEvent::Transition { to_stage: Stage::Failed, ref error, .. }
                if error.as_deref() == Some("e1; e2; e3; e4")
        ));
    }

    #[tokio::test]
    async fn single_error_failures_stay_under_threshold() {
        let junior = Scripted::always(StageOutcome::failure(["flaky test"]));
        let calls = junior.calls();
        let engine = engine_with(
            Arc::new(InMemoryCheckpointStore::new()),
            all_success().with(Stage::JuniorDevelopment, junior),
            EngineConfig::default(),
        );
        let (state, ctx) = submitted(&engine).await;

        let state = engine.run(state, &ctx).await.unwrap().state().clone();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(state.current_stage, Stage::Completed);
        assert_eq!(state.error_count, 1);
    }

    #[tokio::test]
    async fn without_reset_policy_success_does_not_clear_errors() {
        let failing = StageOutcome::failure(["a", "b", "c", "d"]);
        let junior = Scripted::new(vec![failing]);
        let calls = junior.calls();
        let config = EngineConfig {
            reset_errors_on_success: false,
            max_attempts: 2,
            ..Default::default()
        };
        let engine = engine_with(
            Arc::new(InMemoryCheckpointStore::new()),
            all_success().with(Stage::JuniorDevelopment, junior),
            config,
        );
        let (state, ctx) = submitted(&engine).await;

        let state = engine.run(state, &ctx).await.unwrap().state().clone();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(state.current_stage, Stage::Failed);
        assert_eq!(state.failure_reason, Some(FailureReason::RetryLimitExceeded));
    }

    #[tokio::test]
    async fn non_branch_failure_passes_forward() {
        let engine = engine_with(
            Arc::new(InMemoryCheckpointStore::new()),
            all_success().with(
                Stage::ProductManagement,
                Scripted::always(StageOutcome::failure(["no market fit"])),
            ),
            EngineConfig::default(),
        );
        let (state, ctx) = submitted(&engine).await;

        let state = engine.run(state, &ctx).await.unwrap().state().clone();
        assert_eq!(state.current_stage, Stage::Completed);
        assert_eq!(state.stage_results.len(), 7);
        assert!(!state.stage_results[2].success);
        assert_eq!(state.errors, vec!["no market fit".to_string()]);
    }

    #[tokio::test]
    async fn executor_error_becomes_failed_outcome() {
        struct Broken;
        impl crate::stage::StageExecutor for Broken {
            fn name(&self) -> &str {
                "broken"
            }
            async fn execute(&self, _: &WorkflowState) -> Result<StageOutcome, StageError> {
                Err(StageError::Failed("boom".to_string()))
            }
        }

        let engine = engine_with(
            Arc::new(InMemoryCheckpointStore::new()),
            all_success().with(Stage::MarketValidation, Broken),
            EngineConfig::default(),
        );
        let (state, ctx) = submitted(&engine).await;

        let state = engine.run(state, &ctx).await.unwrap().state().clone();
        let first = &state.stage_results[0];
        assert!(!first.success);
        assert_eq!(first.errors, vec!["executor fault: stage failed: boom".to_string()]);
        assert_eq!(state.current_stage, Stage::Completed);
    }

    #[tokio::test]
    async fn executor_panic_is_contained() {
        let engine = engine_with(
            Arc::new(InMemoryCheckpointStore::new()),
            all_success().with(Stage::QualityAssurance, Panics),
            EngineConfig::default(),
        );
        let (state, ctx) = submitted(&engine).await;

        let state = engine.run(state, &ctx).await.unwrap().state().clone();
        let qa = state
            .stage_results
            .iter()
            .find(|r| r.stage == Stage::QualityAssurance)
            .unwrap();
        assert!(!qa.success);
        assert!(qa.errors[0].starts_with("executor fault: stage panicked"));
        assert_eq!(state.current_stage, Stage::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn executor_timeout_is_contained() {
        let config = EngineConfig {
            stage_timeout_secs: 5,
            ..Default::default()
        };
        let engine = engine_with(
            Arc::new(InMemoryCheckpointStore::new()),
            all_success().with(Stage::Deployment, Hang),
            config,
        );
        let (state, ctx) = submitted(&engine).await;

        let state = engine.run(state, &ctx).await.unwrap().state().clone();
        let deploy = state.stage_results.last().unwrap();
        assert_eq!(deploy.stage, Stage::Deployment);
        assert_eq!(
            deploy.errors,
            vec!["executor fault: stage timed out after 5s".to_string()]
        );
    }

    #[tokio::test]
    async fn missing_executor_fails_workflow() {
        let executors = ExecutorRegistry::new()
            .with(Stage::MarketValidation, Succeed)
            .with(Stage::SolutionArchitecture, Succeed);
        let engine = engine_with(
            Arc::new(InMemoryCheckpointStore::new()),
            executors,
            EngineConfig::default(),
        );
        let (state, ctx) = submitted(&engine).await;

        let state = engine.run(state, &ctx).await.unwrap().state().clone();
        assert_eq!(state.current_stage, Stage::Failed);
        assert_eq!(state.failure_reason, Some(FailureReason::ExecutorMissing));
        assert_eq!(state.stage_results.len(), 3);
        assert_eq!(state.stage_results[2].stage, Stage::ProductManagement);
    }

    #[tokio::test]
    async fn cancel_during_stage_discards_result() {
        struct CancelsItself(CancellationToken);
        impl crate::stage::StageExecutor for CancelsItself {
            fn name(&self) -> &str {
                "cancels-itself"
            }
            async fn execute(&self, _: &WorkflowState) -> Result<StageOutcome, StageError> {
                self.0.cancel();
                Ok(StageOutcome::success().with_artifact("architecture", json!("discarded")))
            }
        }

        let store = Arc::new(InMemoryCheckpointStore::new());
        let mut state = WorkflowState::new("X", HashMap::new());
        let ctx = RunContext::new(state.clone(), 64);
        let engine = engine_with(
            Arc::clone(&store),
            all_success().with(
                Stage::SoftwareArchitecture,
                CancelsItself(ctx.cancel.clone()),
            ),
            EngineConfig::default(),
        );
        engine.persist_initial(&mut state).await.unwrap();

        let state = engine.run(state, &ctx).await.unwrap().state().clone();
        assert_eq!(state.current_stage, Stage::Failed);
        assert_eq!(state.failure_reason, Some(FailureReason::Cancelled));
        assert!(!state.artifacts.contains_key("architecture"));

        let last = state.stage_results.last().unwrap();
        assert_eq!(last.stage, Stage::SoftwareArchitecture);
        assert!(last.cancelled);
        assert_eq!(state.stage_results.len(), 4);
    }

    #[tokio::test]
    async fn cancel_before_start_records_cancellation() {
        let engine = engine_with(
            Arc::new(InMemoryCheckpointStore::new()),
            all_success(),
            EngineConfig::default(),
        );
        let (state, ctx) = submitted(&engine).await;
        ctx.cancel.cancel();

        let state = engine.run(state, &ctx).await.unwrap().state().clone();
        assert_eq!(state.current_stage, Stage::Failed);
        assert_eq!(state.stage_results.len(), 1);
        assert!(state.stage_results[0].cancelled);
        assert_eq!(state.stage_results[0].stage, Stage::MarketValidation);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_checkpoint_failures_are_retried() {
        let store = Arc::new(FlakyStore::failing_after(3, 2));
        let engine = engine_with(Arc::clone(&store), all_success(), EngineConfig::default());
        let (state, ctx) = submitted(&engine).await;
        let mut rx = ctx.events.subscribe();

        let state = engine.run(state, &ctx).await.unwrap().state().clone();
        assert_eq!(state.current_stage, Stage::Completed);

        let sequences: Vec<u64> = drain_events(&mut rx)
            .iter()
            .filter_map(|e| e.sequence())
            .collect();
        assert_eq!(sequences, (2..=8).collect::<Vec<u64>>());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_checkpoint_retries_abort_without_transition_event() {
        let store = Arc::new(FlakyStore::failing_after(3, u32::MAX));
        let engine = engine_with(Arc::clone(&store), all_success(), EngineConfig::default());
        let (state, ctx) = submitted(&engine).await;
        let mut rx = ctx.events.subscribe();

        let exit = engine.run(state, &ctx).await.unwrap();
        assert!(matches!(
            exit,
            EngineExit::Aborted { reason: FailureReason::CheckpointUnavailable, .. }
        ));

        let events = drain_events(&mut rx);
        // Sequences 2 and 3 made it; the third transition never did.
        assert_eq!(events.len(), 3);
        assert_eq!(events[1].sequence(), Some(3));
        assert!(matches!(
            events[2],
            StepEvent::Aborted { from_stage: Stage::ProductManagement, .. }
        ));
        assert_eq!(ctx.durable.borrow().version, 3);
        assert_eq!(ctx.aborted.get(), Some(&FailureReason::CheckpointUnavailable));
        assert_eq!(store.append_calls(), 3 + 5);
    }

    #[tokio::test]
    async fn stale_append_supersedes_driver() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let engine = engine_with(Arc::clone(&store), all_success(), EngineConfig::default());
        let (state, ctx) = submitted(&engine).await;

        // Another driver already wrote sequence 2.
        let mut competitor = state.clone();
        competitor.version = 2;
        store.append(&competitor).await.unwrap();

        let mut rx = ctx.events.subscribe();
        let exit = engine.run(state.clone(), &ctx).await.unwrap();
        assert!(matches!(exit, EngineExit::Superseded(_)));
        assert!(drain_events(&mut rx).is_empty());
        assert_eq!(store.history(&state.workflow_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn resume_at_stage_outside_graph_is_rejected() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let engine = WorkflowEngine::new(
            Arc::clone(&store),
            Arc::new(all_success()),
            Arc::new(
                StageGraph::new(Stage::MarketValidation)
                    .with_edge(Stage::MarketValidation, Stage::Completed),
            ),
            EngineConfig::default(),
        );
        let (mut state, ctx) = submitted(&engine).await;
        state.current_stage = Stage::JuniorDevelopment;

        let err = engine.run(state.clone(), &ctx).await.unwrap_err();
        assert!(matches!(err, EngineError::Graph(GraphError::UnknownStage(_))));
        assert_eq!(store.history(&state.workflow_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stage_results_only_grow() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let engine = engine_with(
            Arc::clone(&store),
            all_success().with(
                Stage::JuniorDevelopment,
                Scripted::new(vec![StageOutcome::failure(["a", "b", "c", "d"])]),
            ),
            EngineConfig::default(),
        );
        let (state, ctx) = submitted(&engine).await;
        let id = state.workflow_id;
        engine.run(state, &ctx).await.unwrap();

        let history = store.history(&id).await.unwrap();
        for pair in history.windows(2) {
            assert!(pair[1].state.stage_results.len() >= pair[0].state.stage_results.len());
            assert_eq!(pair[1].sequence, pair[0].sequence + 1);
            assert_eq!(
                pair[1].state.stage_results[..pair[0].state.stage_results.len()],
                pair[0].state.stage_results[..]
            );
        }
    }

    #[test]
    fn merge_counts_at_least_one_error() {
        let mut state = WorkflowState::new("X", HashMap::new());
        merge_outcome(&mut state, Stage::QualityAssurance, StageOutcome::failure(Vec::<String>::new()), 1, 0);
        assert_eq!(state.error_count, 1);

        merge_outcome(&mut state, Stage::QualityAssurance, StageOutcome::failure(["x", "y"]), 2, 0);
        assert_eq!(state.error_count, 3);
        assert_eq!(state.stage_results.len(), 2);
    }

    #[test]
    fn merge_artifacts_last_write_wins() {
        let mut state = WorkflowState::new("X", HashMap::new());
        merge_outcome(
            &mut state,
            Stage::SoftwareArchitecture,
            StageOutcome::success().with_artifact("design", json!("v1")),
            1,
            0,
        );
        merge_outcome(
            &mut state,
            Stage::SeniorDevelopment,
            StageOutcome::success().with_artifact("design", json!("v2")).escalate(),
            1,
            0,
        );
        assert_eq!(state.artifacts["design"], json!("v2"));
        assert!(state.requires_escalation);
        assert_eq!(state.stage_results[1].artifacts, vec!["design".to_string()]);
    }

    #[test]
    fn backoff_doubles() {
        assert_eq!(backoff_delay(100, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(100, 1), Duration::from_millis(200));
        assert_eq!(backoff_delay(100, 3), Duration::from_millis(800));
        assert_eq!(backoff_delay(u64::MAX, 5), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn engine_error_display() {
        let err = EngineError::Checkpoint {
            attempts: 5,
            source: RepositoryError::Connection,
        };
        assert!(err.to_string().contains("5 attempts"));

        let err = EngineError::StaleCheckpoint("expected sequence 3, got 2".to_string());
        assert!(err.to_string().starts_with("stale checkpoint"));
    }
}
