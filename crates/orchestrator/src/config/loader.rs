use std::path::{Path, PathBuf};

use aircheck_common::config::OrchestratorConfig;

use super::validation;

/// Load the orchestrator configuration from `<config_dir>/orchestrator.toml`.
///
/// A missing file yields the documented defaults; a present but malformed or
/// out-of-range file refuses to start. Fails loudly with clear error
/// messages either way.
pub fn load_config(config_dir: &Path) -> Result<OrchestratorConfig, ConfigError> {
    let path = config_dir.join("orchestrator.toml");

    let config = if path.exists() {
        tracing::info!(path = %path.display(), "Loading configuration");
        let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::FileRead {
            path: path.clone(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.clone(),
            detail: e.to_string(),
        })?
    } else {
        tracing::info!(path = %path.display(), "No configuration file, using defaults");
        OrchestratorConfig::default()
    };

    validation::validate(&config)?;

    tracing::info!(
        pool_min = config.pool.min,
        pool_max = config.pool.max,
        heartbeat_timeout_secs = config.heartbeat.timeout_seconds,
        failover_period_secs = config.failover.period_seconds,
        "Configuration loaded successfully"
    );

    Ok(config)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {detail}")]
    Parse { path: PathBuf, detail: String },

    #[error("Validation failed: {0}")]
    Validation(String),
}
