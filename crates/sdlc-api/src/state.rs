//! Application state wiring the engine registry to its infrastructure.
//!
//! The registry is generic over the checkpoint store; AppState pins it to the
//! SQLite implementation. Used by both CLI commands and HTTP handlers.

use std::path::PathBuf;
use std::sync::Arc;

use sdlc_core::graph::StageGraph;
use sdlc_core::registry::EngineRegistry;
use sdlc_infra::config::load_config;
use sdlc_infra::filesystem::{ensure_data_dir, resolve_data_dir};
use sdlc_infra::sqlite::{DatabasePool, SqliteCheckpointStore, default_database_url};
use sdlc_infra::stage::build_executor_registry;
use sdlc_types::config::SdlcConfig;

/// Engine registry pinned to the SQLite checkpoint store.
pub type SqliteRegistry = EngineRegistry<SqliteCheckpointStore>;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SqliteRegistry>,
    pub config: Arc<SdlcConfig>,
}

impl AppState {
    /// Resolve the data directory, load `config.toml` and open the database.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        let config = load_config(&data_dir).await;
        Self::open(data_dir, config).await
    }

    /// Open the database under `data_dir` and build the registry.
    ///
    /// Does not resume unfinished workflows; long-running processes call
    /// `registry.recover()` themselves.
    pub async fn open(data_dir: PathBuf, config: SdlcConfig) -> anyhow::Result<Self> {
        ensure_data_dir(&data_dir).await?;

        let db_pool = DatabasePool::new(&default_database_url(&data_dir)).await?;
        let store = Arc::new(SqliteCheckpointStore::new(db_pool));

        let registry = EngineRegistry::new(
            store,
            build_executor_registry(&config),
            StageGraph::sdlc(),
            config.engine.clone(),
        )?;

        tracing::debug!(data_dir = %data_dir.display(), "application state initialized");

        Ok(Self {
            registry: Arc::new(registry),
            config: Arc::new(config),
        })
    }
}
