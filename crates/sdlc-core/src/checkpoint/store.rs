//! Checkpoint store trait definition.
//!
//! Defines the persistence port for workflow checkpoints. The infrastructure
//! layer (sdlc-infra) implements this trait with SQLite; `InMemoryCheckpointStore`
//! in this crate backs tests and ephemeral runs.

use sdlc_types::error::RepositoryError;
use sdlc_types::workflow::{CheckpointRecord, WorkflowState};
use uuid::Uuid;

/// Append-only, per-workflow ordered checkpoint persistence.
///
/// Sequence numbers are strictly increasing and gapless per workflow,
/// starting at 1. `append` only accepts a state whose `version` is exactly
/// the next sequence; anything else is a stale writer and is rejected with
/// `RepositoryError::Conflict`. A successful `append` must be durable before
/// it returns.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait CheckpointStore: Send + Sync {
    /// Durably append `state` as the next checkpoint. Returns its sequence.
    fn append(
        &self,
        state: &WorkflowState,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    /// The most recent snapshot, if the workflow is known.
    fn latest(
        &self,
        workflow_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<CheckpointRecord>, RepositoryError>> + Send;

    /// Every checkpoint of a workflow, ordered by sequence.
    fn history(
        &self,
        workflow_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<CheckpointRecord>, RepositoryError>> + Send;

    /// Latest checkpoint of every known workflow, oldest workflow first.
    fn list_latest(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<CheckpointRecord>, RepositoryError>> + Send;
}

/// Check `version` against the store's latest sequence for the workflow.
///
/// Shared by store implementations so they agree on stale-write semantics.
pub fn check_next_sequence(
    workflow_id: &Uuid,
    latest: Option<u64>,
    version: u64,
) -> Result<u64, RepositoryError> {
    let expected = latest.unwrap_or(0) + 1;
    if version != expected {
        return Err(RepositoryError::Conflict(format!(
            "workflow {workflow_id}: expected sequence {expected}, got {version}"
        )));
    }
    Ok(expected)
}
