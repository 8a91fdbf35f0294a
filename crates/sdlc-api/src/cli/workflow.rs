//! Workflow CLI commands: run, resume, list, status, history.

use std::collections::HashMap;

use anyhow::{Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use futures_util::StreamExt;
use serde_json::Value;
use uuid::Uuid;

use sdlc_core::checkpoint::CheckpointStore;
use sdlc_core::registry::{EngineRegistry, SubscriptionItem};
use sdlc_types::event::StepEvent;
use sdlc_types::workflow::{Stage, WorkflowState};

use crate::state::AppState;

/// Submit `idea` to `registry` and stream its events until it finishes.
///
/// Ctrl+C requests a cooperative cancel; the stream keeps running until the
/// workflow records the cancellation.
pub async fn run_workflow<S: CheckpointStore + 'static>(
    registry: &EngineRegistry<S>,
    idea: &str,
    metadata: HashMap<String, Value>,
    json: bool,
) -> Result<WorkflowState> {
    let submitted = registry.submit(idea, metadata).await?;

    if !json {
        println!();
        println!(
            "  {} Workflow {} started for: {}",
            style("▶").cyan().bold(),
            style(submitted.workflow_id).dim(),
            style(&submitted.project_idea).bold()
        );
        println!();
    }

    let finished = follow(registry, submitted.workflow_id, 0, json).await?;
    print_outcome(&finished, json)?;
    Ok(finished)
}

/// Resume an unfinished workflow and stream it to the end.
pub async fn resume_workflow(state: &AppState, id: Uuid, json: bool) -> Result<WorkflowState> {
    let resumed_at = state.registry.status(id).await?.version;
    state.registry.resume(id).await?;
    if !json {
        println!();
        println!("  {} Resuming workflow {}", style("↻").cyan().bold(), style(id).dim());
        println!();
    }
    let finished = follow(&state.registry, id, resumed_at, json).await?;
    print_outcome(&finished, json)?;
    Ok(finished)
}

/// Print subscription items until the workflow's stream ends, skipping
/// transitions at or before sequence `after`.
///
/// The subscription always replays, so transitions committed before it was
/// opened are not lost.
async fn follow<S: CheckpointStore + 'static>(
    registry: &EngineRegistry<S>,
    workflow_id: Uuid,
    after: u64,
    json: bool,
) -> Result<WorkflowState> {
    let mut events = registry.subscribe(workflow_id, true).await?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut cancel_requested = false;

    loop {
        tokio::select! {
            item = events.next() => match item {
                Some(SubscriptionItem::Event(event)) => {
                    if event.sequence().is_some_and(|sequence| sequence <= after) {
                        continue;
                    }
                    if json {
                        println!("{}", serde_json::to_string(&event)?);
                    } else {
                        println!("  {}", describe_event(&event));
                    }
                }
                Some(SubscriptionItem::Lagged(skipped)) => {
                    if !json {
                        println!(
                            "  {} {skipped} events skipped (output too slow)",
                            style("!").yellow().bold()
                        );
                    }
                }
                None => break,
            },
            _ = &mut ctrl_c, if !cancel_requested => {
                cancel_requested = true;
                if !json {
                    println!(
                        "  {} Cancelling after the current stage...",
                        style("■").yellow().bold()
                    );
                }
                if let Err(err) = registry.cancel(workflow_id).await {
                    tracing::warn!(%workflow_id, "cancel failed: {err}");
                }
            }
        }
    }

    Ok(registry.status(workflow_id).await?)
}

/// One-line rendering of a step event.
pub fn describe_event(event: &StepEvent) -> String {
    match event {
        StepEvent::Transition {
            sequence,
            from_stage,
            to_stage,
            outcome_summary,
            error,
            ..
        } => {
            let mark = if outcome_summary.success {
                style("✓").green().to_string()
            } else {
                style("✗").red().to_string()
            };
            let mut line = format!(
                "{mark} {from_stage} → {} {}",
                format_stage(*to_stage),
                style(format!("#{sequence}")).dim()
            );
            if let Some(decision) = outcome_summary.decision {
                line.push_str(&format!(" [{decision}]"));
            }
            if outcome_summary.attempt > 1 {
                line.push_str(&format!(" attempt {}", outcome_summary.attempt));
            }
            if let Some(error) = error {
                line.push_str(&format!(" {}", style(error).red().dim()));
            }
            line
        }
        StepEvent::Aborted {
            from_stage, reason, ..
        } => format!(
            "{} {from_stage} aborted: {}",
            style("✗").red().bold(),
            style(reason).red()
        ),
    }
}

fn print_outcome(state: &WorkflowState, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&state.summary())?);
        return Ok(());
    }

    println!();
    match state.current_stage {
        Stage::Completed => {
            println!(
                "  {} Workflow completed ({} stages, {} errors)",
                style("✓").green().bold(),
                state.completed_stages().len(),
                state.error_count
            );
            if let Some(artifacts) = &state.final_artifacts {
                let mut names: Vec<&String> = artifacts.keys().collect();
                names.sort();
                for name in names {
                    println!("    {} {name}", style("•").dim());
                }
            }
        }
        _ => {
            let reason = state
                .failure_reason
                .map(|r| r.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            println!(
                "  {} Workflow {} ({})",
                style("✗").red().bold(),
                format_stage(state.current_stage),
                style(reason).red()
            );
            for error in state.errors.iter().rev().take(5) {
                println!("    {} {}", style("•").dim(), style(error).dim());
            }
        }
    }
    println!();
    Ok(())
}

/// List workflows recorded in the checkpoint store.
pub async fn list_workflows(state: &AppState, json: bool) -> Result<()> {
    let records = state.registry.engine().store().list_latest().await?;
    let summaries: Vec<_> = records.iter().map(|r| r.state.summary()).collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }

    if summaries.is_empty() {
        println!();
        println!(
            "  {} No workflows found. Start one with: {}",
            style("i").blue().bold(),
            style("sdlc run \"<idea>\"").yellow()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(vec![
        Cell::new("ID").fg(Color::White),
        Cell::new("Idea").fg(Color::White),
        Cell::new("Stage").fg(Color::White),
        Cell::new("Done").fg(Color::White),
        Cell::new("Errors").fg(Color::White),
        Cell::new("Updated").fg(Color::White),
    ]);

    for summary in &summaries {
        table.add_row(vec![
            Cell::new(summary.workflow_id).fg(Color::DarkGrey),
            Cell::new(truncate(&summary.project_idea, 40)).fg(Color::Cyan),
            stage_cell(summary.current_stage),
            Cell::new(summary.completed_stages),
            Cell::new(summary.error_count),
            Cell::new(format_relative_time(&summary.updated_at)).fg(Color::DarkGrey),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    println!(
        "  {} workflow{}",
        style(summaries.len()).bold(),
        if summaries.len() == 1 { "" } else { "s" }
    );
    println!();

    Ok(())
}

/// Show the latest checkpointed state of one workflow.
pub async fn show_status(state: &AppState, id: Uuid, json: bool) -> Result<()> {
    let workflow = state.registry.status(id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&workflow)?);
        return Ok(());
    }

    let completed: Vec<String> = workflow
        .completed_stages()
        .iter()
        .map(|s| s.to_string())
        .collect();
    let mut artifacts: Vec<&String> = workflow.artifacts.keys().collect();
    artifacts.sort();

    println!();
    println!("  {}  {}", style("ID:").bold(), style(workflow.workflow_id).dim());
    println!("  {}  {}", style("Idea:").bold(), workflow.project_idea);
    println!("  {}  {}", style("Stage:").bold(), format_stage(workflow.current_stage));
    if let Some(reason) = workflow.failure_reason {
        println!("  {}  {}", style("Reason:").bold(), style(reason).red());
    }
    println!("  {}  {}", style("Completed:").bold(), completed.join(", "));
    println!("  {}  {}", style("Errors:").bold(), workflow.error_count);
    if workflow.requires_escalation {
        println!("  {}  {}", style("Escalation:").bold(), style("requested").yellow());
    }
    println!(
        "  {}  {}",
        style("Artifacts:").bold(),
        if artifacts.is_empty() {
            "(none)".to_string()
        } else {
            artifacts.iter().map(|a| a.as_str()).collect::<Vec<_>>().join(", ")
        }
    );
    println!(
        "  {}  {} ({})",
        style("Updated:").bold(),
        workflow.updated_at.format("%Y-%m-%d %H:%M:%S UTC"),
        format_relative_time(&workflow.updated_at)
    );
    println!();

    Ok(())
}

/// Show every checkpoint of one workflow.
pub async fn show_history(state: &AppState, id: Uuid, json: bool) -> Result<()> {
    let history = state.registry.history(id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&history)?);
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(vec![
        Cell::new("Seq").fg(Color::White),
        Cell::new("Stage").fg(Color::White),
        Cell::new("Last result").fg(Color::White),
        Cell::new("Errors").fg(Color::White),
        Cell::new("Recorded").fg(Color::White),
    ]);

    for record in &history {
        let last = match record.state.stage_results.last() {
            Some(result) => {
                let mark = if result.success { "✓" } else { "✗" };
                match result.decision {
                    Some(decision) => format!("{mark} {} [{decision}]", result.stage),
                    None => format!("{mark} {}", result.stage),
                }
            }
            None => "-".to_string(),
        };
        table.add_row(vec![
            Cell::new(record.sequence),
            stage_cell(record.state.current_stage),
            Cell::new(last),
            Cell::new(record.state.error_count),
            Cell::new(record.recorded_at.format("%H:%M:%S%.3f")).fg(Color::DarkGrey),
        ]);
    }

    println!();
    println!("{table}");
    println!();

    Ok(())
}

/// Parse `KEY=VALUE` entries. Values are JSON when they parse as JSON,
/// plain strings otherwise.
pub fn parse_metadata(entries: &[String]) -> Result<HashMap<String, Value>> {
    let mut metadata = HashMap::new();
    for entry in entries {
        let Some((key, value)) = entry.split_once('=') else {
            bail!("invalid metadata '{entry}', expected KEY=VALUE");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("invalid metadata '{entry}', key is empty");
        }
        let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        metadata.insert(key.to_string(), value);
    }
    Ok(metadata)
}

fn format_stage(stage: Stage) -> String {
    match stage {
        Stage::Completed => style(stage).green().bold().to_string(),
        Stage::Failed => style(stage).red().bold().to_string(),
        _ => style(stage).cyan().to_string(),
    }
}

fn stage_cell(stage: Stage) -> Cell {
    match stage {
        Stage::Completed => Cell::new("● completed").fg(Color::Green),
        Stage::Failed => Cell::new("✗ failed").fg(Color::Red),
        other => Cell::new(format!("○ {other}")).fg(Color::Yellow),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        let head: String = text.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{head}...")
    } else {
        text.to_string()
    }
}

fn format_relative_time(dt: &chrono::DateTime<chrono::Utc>) -> String {
    let now = chrono::Utc::now();
    let diff = now - *dt;

    if diff.num_minutes() < 1 {
        "just now".to_string()
    } else if diff.num_hours() < 1 {
        format!("{}m ago", diff.num_minutes())
    } else if diff.num_days() < 1 {
        format!("{}h ago", diff.num_hours())
    } else if diff.num_days() < 30 {
        format!("{}d ago", diff.num_days())
    } else {
        dt.format("%Y-%m-%d").to_string()
    }
}
