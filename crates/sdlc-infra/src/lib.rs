//! Infrastructure layer for the SDLC orchestrator.
//!
//! Contains the adapters behind the ports defined in `sdlc-core`: the SQLite
//! checkpoint store, `config.toml` loading, data-directory resolution, and
//! the concrete stage executors (placeholder and external command).

pub mod config;
pub mod filesystem;
pub mod sqlite;
pub mod stage;
