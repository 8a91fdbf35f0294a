//! Stage executor backed by an external program.
//!
//! The program receives the full `WorkflowState` as JSON on stdin and must
//! print a `StageOutcome` as JSON on stdout. A non-zero exit, unparsable
//! output or a timeout is reported as a [`StageError`]; the engine turns that
//! into a failed stage outcome.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, Instant};

use sdlc_core::stage::StageExecutor;
use sdlc_types::config::StageCommandConfig;
use sdlc_types::error::StageError;
use sdlc_types::workflow::{StageOutcome, WorkflowState};
use tokio::io::AsyncWriteExt;

/// Runs a configured command for one stage.
#[derive(Debug, Clone)]
pub struct CommandStage {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    timeout: Option<Duration>,
}

impl CommandStage {
    pub fn new(config: &StageCommandConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
            timeout: config.timeout_secs.map(Duration::from_secs),
        }
    }

    async fn run(&self, input: Vec<u8>) -> Result<std::process::Output, StageError> {
        let mut child = tokio::process::Command::new(&self.command)
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StageError::Failed(format!("failed to spawn '{}': {e}", self.command)))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A program that ignores its input may close stdin early.
            if let Err(e) = stdin.write_all(&input).await {
                tracing::debug!(command = %self.command, "stdin closed early: {e}");
            }
            // Drop stdin to close the pipe and signal EOF
        }

        child
            .wait_with_output()
            .await
            .map_err(|e| StageError::Failed(format!("failed to wait for '{}': {e}", self.command)))
    }
}

impl StageExecutor for CommandStage {
    fn name(&self) -> &str {
        &self.command
    }

    async fn execute(&self, state: &WorkflowState) -> Result<StageOutcome, StageError> {
        let input = serde_json::to_vec(state)
            .map_err(|e| StageError::Failed(format!("serialize state: {e}")))?;

        let start = Instant::now();
        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.run(input))
                .await
                .map_err(|_| StageError::Timeout(limit.as_secs()))??,
            None => self.run(input).await?,
        };

        tracing::debug!(
            workflow_id = %state.workflow_id,
            stage = %state.current_stage,
            command = %self.command,
            status = %output.status,
            duration_ms = start.elapsed().as_millis() as u64,
            "stage command finished"
        );

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(StageError::Failed(format!(
                "'{}' exited with {}: {}",
                self.command,
                output.status,
                stderr.trim()
            )));
        }

        serde_json::from_slice::<StageOutcome>(&output.stdout).map_err(|e| {
            StageError::Failed(format!("'{}' printed an invalid outcome: {e}", self.command))
        })
    }
}
