//! Engine registry: owns every live workflow of the process.
//!
//! Each workflow gets a `WorkflowHandle` (cancellation token, event bus,
//! latest durable state) and its own tokio task running the driver loop.
//! Registry bookkeeping lives in a `DashMap`; no lock is ever held across
//! an await point or shared between workflows.
//!
//! A handle is removed as soon as its driver exits, unless the workflow was
//! aborted (the handle then carries the `checkpoint_unavailable` overlay
//! until it is resumed). Everything else is answered from the checkpoint
//! store.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_stream::stream;
use chrono::Utc;
use dashmap::DashMap;
use futures_util::Stream;
use sdlc_types::config::EngineConfig;
use sdlc_types::error::RepositoryError;
use sdlc_types::event::StepEvent;
use sdlc_types::workflow::{CheckpointRecord, Stage, WorkflowState, WorkflowSummary};
use serde_json::Value;
use tokio::sync::{Semaphore, broadcast};
use tracing::Instrument;
use uuid::Uuid;

use crate::checkpoint::CheckpointStore;
use crate::engine::{EngineError, EngineExit, RunContext, WorkflowEngine};
use crate::graph::{GraphError, StageGraph};
use crate::stage::ExecutorRegistry;

// ---------------------------------------------------------------------------
// Subscription stream
// ---------------------------------------------------------------------------

/// One item of a workflow subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionItem {
    Event(StepEvent),
    /// The subscriber fell behind and the oldest `n` events were dropped.
    Lagged(u64),
}

pub type EventStream = Pin<Box<dyn Stream<Item = SubscriptionItem> + Send + 'static>>;

// ---------------------------------------------------------------------------
// WorkflowHandle
// ---------------------------------------------------------------------------

/// Registry-side view of one workflow.
pub struct WorkflowHandle {
    workflow_id: Uuid,
    ctx: RunContext,
    driving: AtomicBool,
}

impl WorkflowHandle {
    fn new(state: WorkflowState, event_buffer: usize) -> Self {
        Self {
            workflow_id: state.workflow_id,
            ctx: RunContext::new(state, event_buffer),
            driving: AtomicBool::new(false),
        }
    }

    pub fn is_driving(&self) -> bool {
        self.driving.load(Ordering::SeqCst)
    }

    /// Last durable state, with an abort overlaid as `failed`.
    pub fn status(&self) -> WorkflowState {
        let mut state = self.ctx.durable.borrow().clone();
        if let Some(reason) = self.ctx.aborted.get() {
            state.current_stage = Stage::Failed;
            state.failure_reason = Some(*reason);
        }
        state
    }
}

// ---------------------------------------------------------------------------
// EngineRegistry
// ---------------------------------------------------------------------------

/// Owns the set of live workflows, keyed by `workflow_id`.
///
/// Constructed once by the process entry point and passed around by `Arc`.
pub struct EngineRegistry<S: CheckpointStore> {
    engine: WorkflowEngine<S>,
    workflows: Arc<DashMap<Uuid, Arc<WorkflowHandle>>>,
    limiter: Option<Arc<Semaphore>>,
}

impl<S: CheckpointStore + 'static> EngineRegistry<S> {
    /// Build a registry over `store`, validating the graph up front.
    pub fn new(
        store: Arc<S>,
        executors: ExecutorRegistry,
        graph: StageGraph,
        config: EngineConfig,
    ) -> Result<Self, RegistryError> {
        graph.validate()?;
        let limiter = config
            .max_concurrent_workflows
            .map(|max| Arc::new(Semaphore::new(max.max(1))));
        Ok(Self {
            engine: WorkflowEngine::new(store, Arc::new(executors), Arc::new(graph), config),
            workflows: Arc::new(DashMap::new()),
            limiter,
        })
    }

    pub fn engine(&self) -> &WorkflowEngine<S> {
        &self.engine
    }

    /// Create a workflow, persist it as sequence 1 and start its driver loop.
    pub async fn submit(
        &self,
        project_idea: impl Into<String>,
        metadata: HashMap<String, Value>,
    ) -> Result<WorkflowState, RegistryError> {
        let mut state = WorkflowState::new(project_idea, metadata);
        self.engine.persist_initial(&mut state).await?;

        let handle = Arc::new(WorkflowHandle::new(
            state.clone(),
            self.engine.config().event_buffer,
        ));
        self.workflows.insert(state.workflow_id, Arc::clone(&handle));

        tracing::info!(
            workflow_id = %state.workflow_id,
            project_idea = state.project_idea.as_str(),
            "workflow submitted"
        );

        self.spawn_driver(handle, state.clone());
        Ok(state)
    }

    /// Last durably checkpointed state.
    pub async fn status(&self, workflow_id: Uuid) -> Result<WorkflowState, RegistryError> {
        if let Ok(handle) = self.handle(workflow_id) {
            return Ok(handle.status());
        }
        self.engine
            .store()
            .latest(&workflow_id)
            .await?
            .map(|record| record.state)
            .ok_or(RegistryError::NotFound(workflow_id))
    }

    /// Summaries of every workflow in the store, oldest first, with live
    /// handles taking precedence.
    pub async fn list(&self) -> Result<Vec<WorkflowSummary>, RegistryError> {
        let records = self.engine.store().list_latest().await?;
        let mut summaries: Vec<WorkflowSummary> = records
            .into_iter()
            .map(|record| match self.handle(record.workflow_id) {
                Ok(handle) => handle.status().summary(),
                Err(_) => record.state.summary(),
            })
            .collect();
        summaries.sort_by_key(|s| (s.created_at, s.workflow_id));
        Ok(summaries)
    }

    /// Workflows whose driver loop is currently running.
    pub fn active_count(&self) -> usize {
        self.workflows
            .iter()
            .filter(|entry| entry.value().is_driving())
            .count()
    }

    /// Full checkpoint history, ordered by sequence.
    pub async fn history(&self, workflow_id: Uuid) -> Result<Vec<CheckpointRecord>, RegistryError> {
        let history = self.engine.store().history(&workflow_id).await?;
        if history.is_empty() {
            return Err(RegistryError::NotFound(workflow_id));
        }
        Ok(history)
    }

    /// Request a cooperative stop after the current stage.
    ///
    /// Only workflows driven by this registry can be cancelled.
    pub async fn cancel(&self, workflow_id: Uuid) -> Result<(), RegistryError> {
        if let Ok(handle) = self.handle(workflow_id) {
            if handle.status().is_terminal() {
                return Err(RegistryError::AlreadyTerminal(workflow_id));
            }
            tracing::info!(workflow_id = %workflow_id, "cancellation requested");
            handle.ctx.cancel.cancel();
            return Ok(());
        }

        let record = self
            .engine
            .store()
            .latest(&workflow_id)
            .await?
            .ok_or(RegistryError::NotFound(workflow_id))?;
        if record.state.is_terminal() {
            Err(RegistryError::AlreadyTerminal(workflow_id))
        } else {
            Err(RegistryError::NotRunning(workflow_id))
        }
    }

    /// Stream step events for one workflow.
    ///
    /// Without `replay` the stream starts at the next transition. With it,
    /// transitions rebuilt from the checkpoint history come first; live
    /// events already replayed are skipped by sequence. The stream ends after
    /// a terminal event, or when the driver exits without one (superseded by
    /// another process). A workflow with no live driver only has its history:
    /// with `replay` that is delivered, without it the stream is empty.
    pub async fn subscribe(
        &self,
        workflow_id: Uuid,
        replay: bool,
    ) -> Result<EventStream, RegistryError> {
        let Ok(handle) = self.handle(workflow_id) else {
            let history = self.history(workflow_id).await?;
            let backlog: Vec<SubscriptionItem> = if replay {
                history
                    .iter()
                    .filter_map(StepEvent::from_record)
                    .map(SubscriptionItem::Event)
                    .collect()
            } else {
                Vec::new()
            };
            return Ok(Box::pin(futures_util::stream::iter(backlog)));
        };
        // Subscribe before reading anything else so no event falls in a gap.
        let mut rx = handle.ctx.events.subscribe();

        let mut backlog = Vec::new();
        if replay {
            for record in self.engine.store().history(&workflow_id).await? {
                backlog.extend(StepEvent::from_record(&record));
            }
        }
        let aborted = handle.ctx.aborted.get().copied();
        let terminal = handle.ctx.durable.borrow().is_terminal();
        let last_stage = handle.ctx.durable.borrow().current_stage;

        Ok(Box::pin(stream! {
            let mut last_sequence = 0u64;

            for event in backlog {
                last_sequence = event.sequence().unwrap_or(last_sequence);
                let done = event.is_terminal();
                yield SubscriptionItem::Event(event);
                if done {
                    return;
                }
            }

            if let Some(reason) = aborted {
                yield SubscriptionItem::Event(StepEvent::Aborted {
                    workflow_id,
                    from_stage: last_stage,
                    reason,
                    timestamp: Utc::now(),
                });
                return;
            }

            loop {
                let received = if terminal && !replay {
                    match rx.try_recv() {
                        Ok(event) => Ok(event),
                        Err(broadcast::error::TryRecvError::Lagged(n)) => {
                            Err(broadcast::error::RecvError::Lagged(n))
                        }
                        Err(_) => break,
                    }
                } else {
                    rx.recv().await
                };

                match received {
                    Ok(event) => {
                        if let Some(sequence) = event.sequence() {
                            if sequence <= last_sequence {
                                continue;
                            }
                            last_sequence = sequence;
                        }
                        let done = event.is_terminal();
                        yield SubscriptionItem::Event(event);
                        if done {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(workflow_id = %workflow_id, skipped, "subscriber lagged");
                        yield SubscriptionItem::Lagged(skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }))
    }

    /// Re-spawn the driver for one non-terminal workflow from its latest
    /// checkpoint.
    pub async fn resume(&self, workflow_id: Uuid) -> Result<(), RegistryError> {
        let driving = self.handle(workflow_id).is_ok_and(|handle| handle.is_driving());
        if driving {
            return Err(RegistryError::AlreadyRunning(workflow_id));
        }

        let record = self
            .engine
            .store()
            .latest(&workflow_id)
            .await?
            .ok_or(RegistryError::NotFound(workflow_id))?;
        if record.state.is_terminal() {
            return Err(RegistryError::AlreadyTerminal(workflow_id));
        }

        tracing::info!(
            workflow_id = %workflow_id,
            sequence = record.sequence,
            stage = %record.state.current_stage,
            "resuming workflow"
        );
        let handle = Arc::new(WorkflowHandle::new(
            record.state.clone(),
            self.engine.config().event_buffer,
        ));
        self.workflows.insert(workflow_id, Arc::clone(&handle));
        self.spawn_driver(handle, record.state);
        Ok(())
    }

    /// Resume every non-terminal workflow found in the store. Returns how
    /// many were resumed.
    pub async fn recover(&self) -> Result<usize, RegistryError> {
        let records = self.engine.store().list_latest().await?;
        let known = records.len();
        let mut resumed = 0;

        for record in records {
            let workflow_id = record.workflow_id;
            if record.state.is_terminal() || self.workflows.contains_key(&workflow_id) {
                continue;
            }
            let handle = Arc::new(WorkflowHandle::new(
                record.state.clone(),
                self.engine.config().event_buffer,
            ));
            self.workflows.insert(workflow_id, Arc::clone(&handle));
            self.spawn_driver(handle, record.state);
            resumed += 1;
        }

        tracing::info!(
            known,
            resumed,
            "recovered workflows from checkpoint store"
        );
        Ok(resumed)
    }

    fn handle(&self, workflow_id: Uuid) -> Result<Arc<WorkflowHandle>, RegistryError> {
        self.workflows
            .get(&workflow_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(RegistryError::NotFound(workflow_id))
    }

    fn spawn_driver(&self, handle: Arc<WorkflowHandle>, state: WorkflowState) {
        if handle.driving.swap(true, Ordering::SeqCst) {
            return;
        }

        let engine = self.engine.clone();
        let limiter = self.limiter.clone();
        let workflows = Arc::clone(&self.workflows);
        let span = tracing::info_span!("workflow", workflow_id = %handle.workflow_id);

        tokio::spawn(
            async move {
                let _permit = match limiter {
                    Some(semaphore) => tokio::select! {
                        permit = semaphore.acquire_owned() => permit.ok(),
                        _ = handle.ctx.cancel.cancelled() => None,
                    },
                    None => None,
                };

                let keep = match engine.run(state, &handle.ctx).await {
                    Ok(EngineExit::Finished(_)) => false,
                    Ok(EngineExit::Aborted { reason, .. }) => {
                        tracing::warn!(%reason, "workflow aborted");
                        true
                    }
                    Ok(EngineExit::Superseded(_)) => {
                        tracing::warn!("workflow driven elsewhere, driver stopped");
                        false
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "driver loop failed");
                        false
                    }
                };

                // Dropping the last handle closes the bus, which ends every
                // open subscription. A resume may already have replaced it.
                if !keep {
                    workflows.remove_if(&handle.workflow_id, |_, current| {
                        Arc::ptr_eq(current, &handle)
                    });
                }
                handle.driving.store(false, Ordering::SeqCst);
            }
            .instrument(span),
        );
    }
}

// ---------------------------------------------------------------------------
// RegistryError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("workflow not found: {0}")]
    NotFound(Uuid),

    #[error("workflow {0} is already terminal")]
    AlreadyTerminal(Uuid),

    #[error("workflow {0} is already running")]
    AlreadyRunning(Uuid),

    #[error("workflow {0} is not running in this process")]
    NotRunning(Uuid),

    #[error("checkpoint store error: {0}")]
    Store(#[from] RepositoryError),

    #[error("invalid stage graph: {0}")]
    Graph(#[from] GraphError),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
