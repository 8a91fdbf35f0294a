//! Configuration types for the SDLC orchestrator.
//!
//! `SdlcConfig` represents the top-level `config.toml` that controls the
//! engine's branch policy, checkpoint retry behaviour, event buffering and
//! which external command backs each stage.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
///
/// Loaded from `~/.sdlc/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SdlcConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub server: ServerConfig,

    /// External commands keyed by stage name (e.g. `junior_development`).
    /// Stages without an entry use the built-in placeholder executor.
    #[serde(default)]
    pub stages: HashMap<String, StageCommandConfig>,
}

/// Tunables for the workflow engine and registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Retry the branch stage once `error_count` exceeds this value.
    #[serde(default = "default_retry_threshold")]
    pub retry_threshold: u32,

    /// Maximum retries of the branch stage before the workflow fails.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Reset `error_count` when the branch stage succeeds.
    #[serde(default = "default_true")]
    pub reset_errors_on_success: bool,

    /// Checkpoint write attempts before failing with `checkpoint_unavailable`.
    #[serde(default = "default_checkpoint_retry_attempts")]
    pub checkpoint_retry_attempts: u32,

    /// Base delay for exponential backoff between checkpoint write attempts.
    #[serde(default = "default_checkpoint_retry_base_ms")]
    pub checkpoint_retry_base_ms: u64,

    /// Per-workflow event buffer. Slow subscribers lose the oldest events.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Upper bound on a single stage execution.
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,

    /// Concurrently running workflows. `None` means unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_workflows: Option<usize>,
}

fn default_retry_threshold() -> u32 {
    3
}

fn default_max_attempts() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

fn default_checkpoint_retry_attempts() -> u32 {
    5
}

fn default_checkpoint_retry_base_ms() -> u64 {
    100
}

fn default_event_buffer() -> usize {
    64
}

fn default_stage_timeout_secs() -> u64 {
    300
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry_threshold: default_retry_threshold(),
            max_attempts: default_max_attempts(),
            reset_errors_on_success: default_true(),
            checkpoint_retry_attempts: default_checkpoint_retry_attempts(),
            checkpoint_retry_base_ms: default_checkpoint_retry_base_ms(),
            event_buffer: default_event_buffer(),
            stage_timeout_secs: default_stage_timeout_secs(),
            max_concurrent_workflows: None,
        }
    }
}

/// Where `sdlc serve` listens when no CLI flag overrides it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// An external program backing one stage.
///
/// The program receives the workflow state as JSON on stdin and must print a
/// `StageOutcome` as JSON on stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageCommandConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Overrides `engine.stage_timeout_secs` for this stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}
