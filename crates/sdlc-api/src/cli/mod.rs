//! CLI command definitions for the `sdlc` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod workflow;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use uuid::Uuid;

/// Drive product ideas through the SDLC stage pipeline.
#[derive(Parser)]
#[command(name = "sdlc", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export spans to stdout through OpenTelemetry.
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP/WebSocket server and resume unfinished workflows.
    Serve {
        /// Port to listen on (default from config.toml, else 8000).
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to (default from config.toml, else 127.0.0.1).
        #[arg(long)]
        host: Option<String>,
    },

    /// Submit a project idea and stream its progress until it finishes.
    Run {
        /// The product idea to validate, design, build and ship.
        idea: String,

        /// Metadata entries as key=value (value parsed as JSON when possible).
        #[arg(short, long = "meta", value_name = "KEY=VALUE")]
        metadata: Vec<String>,

        /// Keep checkpoints in memory only; nothing is written to disk.
        #[arg(long)]
        ephemeral: bool,
    },

    /// Resume an unfinished workflow from its latest checkpoint.
    Resume {
        /// Workflow ID.
        id: Uuid,
    },

    /// List known workflows.
    #[command(alias = "ls")]
    List,

    /// Show the latest checkpointed state of a workflow.
    Status {
        /// Workflow ID.
        id: Uuid,
    },

    /// Show the full checkpoint history of a workflow.
    History {
        /// Workflow ID.
        id: Uuid,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}
