//! In-memory checkpoint store.
//!
//! Keeps every workflow's checkpoints in a `DashMap` of ordered vectors.
//! Not durable across restarts; used by tests and by `sdlc run --ephemeral`.

use dashmap::DashMap;
use sdlc_types::error::RepositoryError;
use sdlc_types::workflow::{CheckpointRecord, WorkflowState};
use uuid::Uuid;

use super::store::{CheckpointStore, check_next_sequence};

#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    records: DashMap<Uuid, Vec<CheckpointRecord>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    async fn append(&self, state: &WorkflowState) -> Result<u64, RepositoryError> {
        // The entry guard holds the shard lock, so check-and-push is atomic.
        let mut entry = self.records.entry(state.workflow_id).or_default();
        let latest = entry.last().map(|r| r.sequence);
        let sequence = check_next_sequence(&state.workflow_id, latest, state.version)?;

        entry.push(CheckpointRecord {
            workflow_id: state.workflow_id,
            sequence,
            state: state.clone(),
            recorded_at: state.updated_at,
        });
        Ok(sequence)
    }

    async fn latest(&self, workflow_id: &Uuid) -> Result<Option<CheckpointRecord>, RepositoryError> {
        Ok(self
            .records
            .get(workflow_id)
            .and_then(|records| records.last().cloned()))
    }

    async fn history(&self, workflow_id: &Uuid) -> Result<Vec<CheckpointRecord>, RepositoryError> {
        Ok(self
            .records
            .get(workflow_id)
            .map(|records| records.value().clone())
            .unwrap_or_default())
    }

    async fn list_latest(&self) -> Result<Vec<CheckpointRecord>, RepositoryError> {
        let mut latest: Vec<CheckpointRecord> = self
            .records
            .iter()
            .filter_map(|entry| entry.value().last().cloned())
            .collect();
        latest.sort_by_key(|r| (r.state.created_at, r.workflow_id));
        Ok(latest)
    }
}
