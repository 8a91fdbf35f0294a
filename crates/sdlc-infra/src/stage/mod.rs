//! Concrete stage executors and the wiring from `config.toml` to an
//! [`ExecutorRegistry`].

pub mod command;
pub mod placeholder;

use sdlc_core::stage::ExecutorRegistry;
use sdlc_types::config::SdlcConfig;
use sdlc_types::workflow::Stage;

pub use command::CommandStage;
pub use placeholder::{PlaceholderStage, placeholder_registry};

/// Build the executor set for the binary.
///
/// Every executable stage gets a [`PlaceholderStage`] unless `[stages.<name>]`
/// configures a command for it. Entries naming an unknown or non-executable
/// stage are logged and ignored.
pub fn build_executor_registry(config: &SdlcConfig) -> ExecutorRegistry {
    let mut registry = placeholder_registry();

    for (name, command) in &config.stages {
        let stage = match name.parse::<Stage>() {
            Ok(stage) if stage.is_executable() => stage,
            Ok(stage) => {
                tracing::warn!(%stage, "ignoring command for non-executable stage");
                continue;
            }
            Err(err) => {
                tracing::warn!("ignoring [stages.{name}]: {err}");
                continue;
            }
        };
        tracing::info!(%stage, command = %command.command, "stage backed by external command");
        registry = registry.with(stage, CommandStage::new(command));
    }

    registry
}
