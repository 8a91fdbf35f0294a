//! SDLC workflow orchestrator CLI and HTTP entry point.
//!
//! Binary name: `sdlc`
//!
//! Parses CLI arguments, initializes tracing, the checkpoint database and the
//! engine registry, then dispatches to the command handler or starts the
//! HTTP/WebSocket server.

mod cli;
mod http;
mod state;

use std::sync::Arc;

use anyhow::{Context, anyhow};
use clap::Parser;
use clap_complete::generate;

use sdlc_core::checkpoint::InMemoryCheckpointStore;
use sdlc_core::graph::StageGraph;
use sdlc_core::registry::EngineRegistry;
use sdlc_infra::config::load_config;
use sdlc_infra::filesystem::resolve_data_dir;
use sdlc_infra::stage::build_executor_registry;
use sdlc_types::workflow::{Stage, WorkflowState};

use cli::{Cli, Commands};
use state::AppState;

/// Default log filter for the given verbosity. `RUST_LOG` overrides it.
fn log_filter(verbose: u8, quiet: bool) -> &'static str {
    match verbose {
        0 if quiet => "error",
        0 => "warn",
        1 => "info,sdlc_core=debug,sdlc_infra=debug,sdlc_api=debug",
        _ => "trace",
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    sdlc_observe::tracing_setup::init_tracing(log_filter(cli.verbose, cli.quiet), cli.otel)
        .map_err(|e| anyhow!("failed to initialize tracing: {e}"))?;

    let result = dispatch(cli).await;
    sdlc_observe::tracing_setup::shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Completions { shell } => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            generate(shell, &mut cmd, "sdlc", &mut std::io::stdout());
        }

        Commands::Run {
            idea,
            metadata,
            ephemeral,
        } => {
            let metadata = cli::workflow::parse_metadata(&metadata)?;
            let finished = if ephemeral {
                let config = load_config(&resolve_data_dir()).await;
                let registry = EngineRegistry::new(
                    Arc::new(InMemoryCheckpointStore::new()),
                    build_executor_registry(&config),
                    StageGraph::sdlc(),
                    config.engine.clone(),
                )?;
                cli::workflow::run_workflow(&registry, &idea, metadata, cli.json).await?
            } else {
                let state = AppState::init().await?;
                cli::workflow::run_workflow(&state.registry, &idea, metadata, cli.json).await?
            };
            ensure_completed(&finished)?;
        }

        Commands::Resume { id } => {
            let state = AppState::init().await?;
            let finished = cli::workflow::resume_workflow(&state, id, cli.json).await?;
            ensure_completed(&finished)?;
        }

        Commands::List => {
            let state = AppState::init().await?;
            cli::workflow::list_workflows(&state, cli.json).await?;
        }

        Commands::Status { id } => {
            let state = AppState::init().await?;
            cli::workflow::show_status(&state, id, cli.json).await?;
        }

        Commands::History { id } => {
            let state = AppState::init().await?;
            cli::workflow::show_history(&state, id, cli.json).await?;
        }

        Commands::Serve { port, host } => {
            let state = AppState::init().await?;
            let resumed = state.registry.recover().await?;

            let host = host.unwrap_or_else(|| state.config.server.host.clone());
            let port = port.unwrap_or(state.config.server.port);
            let addr = format!("{host}:{port}");
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .with_context(|| format!("failed to bind {addr}"))?;

            if !cli.quiet {
                println!(
                    "  {} SDLC API listening on {}",
                    console::style("⚡").bold(),
                    console::style(format!("http://{addr}")).cyan()
                );
                if resumed > 0 {
                    println!(
                        "  {} Resumed {resumed} unfinished workflow{}",
                        console::style("↻").bold(),
                        if resumed == 1 { "" } else { "s" }
                    );
                }
                println!("  {}", console::style("Press Ctrl+C to stop").dim());
            }

            let router = http::router::build_router(state);

            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown_signal())
                .await?;

            if !cli.quiet {
                println!("\n  Server stopped.");
            }
        }
    }

    Ok(())
}

/// Non-zero exit for workflows that ended in `failed`.
fn ensure_completed(state: &WorkflowState) -> anyhow::Result<()> {
    if state.current_stage == Stage::Completed {
        return Ok(());
    }
    let reason = state
        .failure_reason
        .map(|r| r.to_string())
        .unwrap_or_else(|| state.current_stage.to_string());
    Err(anyhow!("workflow {} failed: {reason}", state.workflow_id))
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
