//! SQLite checkpoint store implementation.
//!
//! Implements `CheckpointStore` from `sdlc-core` using sqlx with split
//! read/write pools. Each checkpoint row stores the full `WorkflowState` as a
//! JSON blob keyed by `(workflow_id, sequence)`; the composite primary key
//! keeps history totally ordered and rejects duplicate sequences.

use chrono::{DateTime, SecondsFormat, Utc};
use sdlc_core::checkpoint::CheckpointStore;
use sdlc_core::checkpoint::store::check_next_sequence;
use sdlc_types::error::RepositoryError;
use sdlc_types::workflow::{CheckpointRecord, WorkflowState};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `CheckpointStore`.
pub struct SqliteCheckpointStore {
    pool: DatabasePool,
}

impl SqliteCheckpointStore {
    /// Create a new store backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct CheckpointRow {
    workflow_id: String,
    sequence: i64,
    state: String,
    recorded_at: String,
}

impl CheckpointRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            workflow_id: row.try_get("workflow_id")?,
            sequence: row.try_get("sequence")?,
            state: row.try_get("state")?,
            recorded_at: row.try_get("recorded_at")?,
        })
    }

    fn into_record(self) -> Result<CheckpointRecord, RepositoryError> {
        let workflow_id = parse_uuid(&self.workflow_id)?;
        let state: WorkflowState = serde_json::from_str(&self.state)
            .map_err(|e| RepositoryError::Query(format!("invalid checkpoint state JSON: {e}")))?;
        let sequence = u64::try_from(self.sequence)
            .map_err(|_| RepositoryError::Query(format!("invalid sequence: {}", self.sequence)))?;

        Ok(CheckpointRecord {
            workflow_id,
            sequence,
            state,
            recorded_at: parse_datetime(&self.recorded_at)?,
        })
    }
}

fn rows_into_records(rows: Vec<sqlx::sqlite::SqliteRow>) -> Result<Vec<CheckpointRecord>, RepositoryError> {
    rows.iter()
        .map(|row| {
            CheckpointRow::from_row(row)
                .map_err(|e| RepositoryError::Query(e.to_string()))?
                .into_record()
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width RFC 3339 so text ordering in SQL matches time ordering.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Map sqlx errors, keeping connectivity problems distinct from query bugs
/// so the engine's retry loop sees them as transient.
fn map_sqlx(e: sqlx::Error) -> RepositoryError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            RepositoryError::Connection
        }
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            RepositoryError::Conflict(db.message().to_string())
        }
        other => RepositoryError::Query(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// CheckpointStore impl
// ---------------------------------------------------------------------------

impl CheckpointStore for SqliteCheckpointStore {
    async fn append(&self, state: &WorkflowState) -> Result<u64, RepositoryError> {
        let state_json = serde_json::to_string(state)
            .map_err(|e| RepositoryError::Query(format!("serialize state: {e}")))?;
        let workflow_id = state.workflow_id.to_string();

        let mut tx = self.pool.writer.begin().await.map_err(map_sqlx)?;

        let latest: Option<i64> =
            sqlx::query_scalar("SELECT MAX(sequence) FROM checkpoints WHERE workflow_id = ?")
                .bind(&workflow_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(map_sqlx)?;
        let latest = latest.map(|s| s as u64);
        let sequence = check_next_sequence(&state.workflow_id, latest, state.version)?;

        if sequence == 1 {
            sqlx::query(
                "INSERT OR IGNORE INTO workflows (id, project_idea, created_at) VALUES (?, ?, ?)",
            )
            .bind(&workflow_id)
            .bind(&state.project_idea)
            .bind(format_datetime(&state.created_at))
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        }

        sqlx::query(
            r#"INSERT INTO checkpoints (workflow_id, sequence, current_stage, state, recorded_at)
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(&workflow_id)
        .bind(sequence as i64)
        .bind(state.current_stage.as_str())
        .bind(&state_json)
        .bind(format_datetime(&state.updated_at))
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        tx.commit().await.map_err(map_sqlx)?;

        tracing::debug!(
            workflow_id = %state.workflow_id,
            sequence,
            stage = %state.current_stage,
            "checkpoint appended"
        );
        Ok(sequence)
    }

    async fn latest(&self, workflow_id: &Uuid) -> Result<Option<CheckpointRecord>, RepositoryError> {
        let row = sqlx::query(
            r#"SELECT workflow_id, sequence, state, recorded_at FROM checkpoints
               WHERE workflow_id = ? ORDER BY sequence DESC LIMIT 1"#,
        )
        .bind(workflow_id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(map_sqlx)?;

        match row {
            Some(row) => {
                let r = CheckpointRow::from_row(&row).map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_record()?))
            }
            None => Ok(None),
        }
    }

    async fn history(&self, workflow_id: &Uuid) -> Result<Vec<CheckpointRecord>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT workflow_id, sequence, state, recorded_at FROM checkpoints
               WHERE workflow_id = ? ORDER BY sequence ASC"#,
        )
        .bind(workflow_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(map_sqlx)?;

        rows_into_records(rows)
    }

    async fn list_latest(&self) -> Result<Vec<CheckpointRecord>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT c.workflow_id, c.sequence, c.state, c.recorded_at
               FROM checkpoints c
               JOIN (SELECT workflow_id, MAX(sequence) AS max_sequence
                     FROM checkpoints GROUP BY workflow_id) m
                 ON c.workflow_id = m.workflow_id AND c.sequence = m.max_sequence
               JOIN workflows w ON w.id = c.workflow_id
               ORDER BY w.created_at ASC, w.id ASC"#,
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(map_sqlx)?;

        rows_into_records(rows)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use sdlc_core::engine::{RunContext, WorkflowEngine};
    use sdlc_core::graph::StageGraph;
    use sdlc_core::registry::EngineRegistry;
    use sdlc_types::config::EngineConfig;
    use sdlc_types::workflow::Stage;
    use serde_json::json;

    use super::*;
    use crate::sqlite::pool::default_database_url;
    use crate::stage::placeholder::placeholder_registry;

    async fn test_store() -> (SqliteCheckpointStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::new(&default_database_url(dir.path())).await.unwrap();
        (SqliteCheckpointStore::new(pool), dir)
    }

    fn sample_state() -> WorkflowState {
        let mut metadata = HashMap::new();
        metadata.insert("owner".to_string(), json!("platform-team"));
        WorkflowState::new("A habit tracker for remote teams", metadata)
    }

    #[tokio::test]
    async fn append_and_latest_roundtrip() {
        let (store, _dir) = test_store().await;
        let mut state = sample_state();
        state.version = 1;
        assert_eq!(store.append(&state).await.unwrap(), 1);

        state.version = 2;
        state.current_stage = Stage::SolutionArchitecture;
        state.attempt_counts.insert(Stage::JuniorDevelopment, 2);
        state.artifacts.insert("market_report".to_string(), json!({"tam": "large"}));
        assert_eq!(store.append(&state).await.unwrap(), 2);

        let latest = store.latest(&state.workflow_id).await.unwrap().unwrap();
        assert_eq!(latest.sequence, 2);
        assert_eq!(latest.state, state);
        assert_eq!(latest.recorded_at, state.updated_at);
    }

    #[tokio::test]
    async fn stale_version_is_conflict() {
        let (store, _dir) = test_store().await;
        let mut state = sample_state();
        state.version = 1;
        store.append(&state).await.unwrap();
        state.version = 2;
        store.append(&state).await.unwrap();

        state.version = 2;
        let err = store.append(&state).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        state.version = 7;
        assert!(matches!(
            store.append(&state).await,
            Err(RepositoryError::Conflict(_))
        ));
        assert_eq!(store.history(&state.workflow_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn history_is_ordered() {
        let (store, _dir) = test_store().await;
        let mut state = sample_state();
        for version in 1..=4 {
            state.version = version;
            store.append(&state).await.unwrap();
        }

        let sequences: Vec<u64> = store
            .history(&state.workflow_id)
            .await
            .unwrap()
            .iter()
            .map(|r| r.sequence)
            .collect();
        assert_eq!(sequences, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn unknown_workflow_is_empty() {
        let (store, _dir) = test_store().await;
        let id = Uuid::now_v7();
        assert!(store.latest(&id).await.unwrap().is_none());
        assert!(store.history(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_latest_returns_one_row_per_workflow() {
        let (store, _dir) = test_store().await;
        let mut first = sample_state();
        first.version = 1;
        store.append(&first).await.unwrap();
        first.version = 2;
        first.current_stage = Stage::Completed;
        store.append(&first).await.unwrap();

        let mut second = WorkflowState::new("second", HashMap::new());
        second.version = 1;
        store.append(&second).await.unwrap();

        let latest = store.list_latest().await.unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].workflow_id, first.workflow_id);
        assert_eq!(latest[0].state.current_stage, Stage::Completed);
        assert_eq!(latest[1].sequence, 1);
    }

    #[tokio::test]
    async fn engine_runs_against_sqlite() {
        let (store, _dir) = test_store().await;
        let store = Arc::new(store);
        let engine = WorkflowEngine::new(
            Arc::clone(&store),
            Arc::new(placeholder_registry()),
            Arc::new(StageGraph::sdlc()),
            EngineConfig::default(),
        );

        let mut state = sample_state();
        engine.persist_initial(&mut state).await.unwrap();
        let ctx = RunContext::new(state.clone(), 16);
        let finished = engine.run(state, &ctx).await.unwrap().state().clone();
        assert_eq!(finished.current_stage, Stage::Completed);

        // Everything the engine reported is reproducible from the store.
        let latest = store.latest(&finished.workflow_id).await.unwrap().unwrap();
        assert_eq!(latest.state, finished);
        assert_eq!(latest.sequence, finished.version);
    }

    #[tokio::test]
    async fn registry_recovers_from_sqlite_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let url = default_database_url(dir.path());

        // First process: a workflow checkpointed mid-run, then the process died.
        let workflow_id = {
            let store = SqliteCheckpointStore::new(DatabasePool::new(&url).await.unwrap());
            let mut state = sample_state();
            state.version = 1;
            store.append(&state).await.unwrap();
            state.version = 2;
            state.current_stage = Stage::QualityAssurance;
            store.append(&state).await.unwrap();
            state.workflow_id
        };

        // Second process.
        let store = Arc::new(SqliteCheckpointStore::new(DatabasePool::new(&url).await.unwrap()));
        let registry = EngineRegistry::new(
            store,
            placeholder_registry(),
            StageGraph::sdlc(),
            EngineConfig::default(),
        )
        .unwrap();
        assert_eq!(registry.recover().await.unwrap(), 1);

        let mut state = registry.status(workflow_id).await.unwrap();
        for _ in 0..400 {
            if state.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            state = registry.status(workflow_id).await.unwrap();
        }
        assert_eq!(state.current_stage, Stage::Completed);
        let stages: Vec<Stage> = state.stage_results.iter().map(|r| r.stage).collect();
        assert_eq!(stages, vec![Stage::QualityAssurance, Stage::Deployment]);
    }
}
