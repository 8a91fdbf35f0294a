//! Configuration loader for the SDLC orchestrator.
//!
//! Reads `config.toml` from the data directory (`~/.sdlc/` in production)
//! and deserializes it into [`SdlcConfig`]. Falls back to defaults when the
//! file is missing or malformed.

use std::path::Path;

use sdlc_types::config::SdlcConfig;

/// Load configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`SdlcConfig::default()`].
/// - If the file exists but fails to read or parse, logs a warning and returns the default.
/// - Otherwise returns the parsed config, with unset fields defaulted.
pub async fn load_config(data_dir: &Path) -> SdlcConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return SdlcConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return SdlcConfig::default();
        }
    };

    match toml::from_str::<SdlcConfig>(&content) {
        Ok(config) => {
            tracing::debug!(
                path = %config_path.display(),
                stages = config.stages.len(),
                "loaded config"
            );
            config
        }
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            SdlcConfig::default()
        }
    }
}
