//! Data directory layout for the SDLC orchestrator.
//!
//! Everything the binary persists lives under one directory: the SQLite
//! checkpoint database (`sdlc.db`) and the optional `config.toml`.

use std::path::{Path, PathBuf};

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `SDLC_DATA_DIR` environment variable
/// 2. `~/.sdlc`
/// 3. `./.sdlc` when no home directory is known
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("SDLC_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".sdlc");
    }

    PathBuf::from(".sdlc")
}

/// Create the data directory if needed.
pub async fn ensure_data_dir(data_dir: &Path) -> Result<(), std::io::Error> {
    tokio::fs::create_dir_all(data_dir).await
}
