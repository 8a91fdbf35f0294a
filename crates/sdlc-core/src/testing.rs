//! Stub executors and stores shared by the engine and registry tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use sdlc_types::error::{RepositoryError, StageError};
use sdlc_types::event::StepEvent;
use sdlc_types::workflow::{CheckpointRecord, Stage, StageOutcome, WorkflowState};
use serde_json::json;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::checkpoint::{CheckpointStore, InMemoryCheckpointStore};
use crate::stage::{ExecutorRegistry, StageExecutor};

/// Succeeds with a `<stage>_output` artifact.
pub struct Succeed;

impl StageExecutor for Succeed {
    fn name(&self) -> &str {
        "succeed"
    }

    async fn execute(&self, state: &WorkflowState) -> Result<StageOutcome, StageError> {
        Ok(success_for(state.current_stage))
    }
}

fn success_for(stage: Stage) -> StageOutcome {
    StageOutcome::success().with_artifact(format!("{stage}_output"), json!({"stage": stage}))
}

/// Every executable stage backed by `Succeed`.
pub fn all_success() -> ExecutorRegistry {
    Stage::EXECUTABLE
        .into_iter()
        .fold(ExecutorRegistry::new(), |registry, stage| {
            registry.with(stage, Succeed)
        })
}

/// Plays back a fixed list of outcomes, then a fallback for every later call.
pub struct Scripted {
    outcomes: Mutex<VecDeque<StageOutcome>>,
    fallback: Option<StageOutcome>,
    calls: Arc<AtomicU32>,
}

impl Scripted {
    /// Play `outcomes`, then succeed.
    pub fn new(outcomes: Vec<StageOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            fallback: None,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Return `outcome` on every call.
    pub fn always(outcome: StageOutcome) -> Self {
        Self {
            outcomes: Mutex::new(VecDeque::new()),
            fallback: Some(outcome),
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn calls(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.calls)
    }
}

impl StageExecutor for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn execute(&self, state: &WorkflowState) -> Result<StageOutcome, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.outcomes.lock().unwrap().pop_front();
        Ok(next
            .or_else(|| self.fallback.clone())
            .unwrap_or_else(|| success_for(state.current_stage)))
    }
}

/// Panics inside the executor future.
pub struct Panics;

impl StageExecutor for Panics {
    fn name(&self) -> &str {
        "panics"
    }

    async fn execute(&self, _state: &WorkflowState) -> Result<StageOutcome, StageError> {
        panic!("executor blew up");
    }
}

/// Never finishes on its own.
pub struct Hang;

impl StageExecutor for Hang {
    fn name(&self) -> &str {
        "hang"
    }

    async fn execute(&self, _state: &WorkflowState) -> Result<StageOutcome, StageError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(StageOutcome::success())
    }
}

/// Waits until released, so tests can observe a workflow mid-run.
pub struct Gate {
    release: Arc<tokio::sync::Notify>,
}

impl Gate {
    pub fn new() -> (Self, Arc<tokio::sync::Notify>) {
        let release = Arc::new(tokio::sync::Notify::new());
        (
            Self {
                release: Arc::clone(&release),
            },
            release,
        )
    }
}

impl StageExecutor for Gate {
    fn name(&self) -> &str {
        "gate"
    }

    async fn execute(&self, state: &WorkflowState) -> Result<StageOutcome, StageError> {
        self.release.notified().await;
        Ok(success_for(state.current_stage))
    }
}

/// In-memory store whose appends succeed `ok_first` times, then fail
/// `failures` times with a connection error, then succeed again.
pub struct FlakyStore {
    inner: InMemoryCheckpointStore,
    ok_first: u32,
    failures: u32,
    calls: AtomicU32,
}

impl FlakyStore {
    pub fn failing_after(ok_first: u32, failures: u32) -> Self {
        Self {
            inner: InMemoryCheckpointStore::new(),
            ok_first,
            failures,
            calls: AtomicU32::new(0),
        }
    }

    pub fn append_calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CheckpointStore for FlakyStore {
    async fn append(&self, state: &WorkflowState) -> Result<u64, RepositoryError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call >= self.ok_first && call - self.ok_first < self.failures {
            return Err(RepositoryError::Connection);
        }
        self.inner.append(state).await
    }

    async fn latest(&self, workflow_id: &Uuid) -> Result<Option<CheckpointRecord>, RepositoryError> {
        self.inner.latest(workflow_id).await
    }

    async fn history(&self, workflow_id: &Uuid) -> Result<Vec<CheckpointRecord>, RepositoryError> {
        self.inner.history(workflow_id).await
    }

    async fn list_latest(&self) -> Result<Vec<CheckpointRecord>, RepositoryError> {
        self.inner.list_latest().await
    }
}

/// Everything currently buffered on `rx`.
pub fn drain_events(rx: &mut broadcast::Receiver<StepEvent>) -> Vec<StepEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
