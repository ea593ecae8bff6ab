//! Configuration file loader for the `.content-pipeline/` directory.
//!
//! This module provides functionality to load:
//! - `config.toml`: engine settings (retry policy, checkpoints, auto mode,
//!   storage, logging)
//! - run parameter files in YAML or JSON, passed to `start`

use crate::config::error::ConfigError;
use crate::config::error::ConfigResult;
use crate::config::models::EngineConfig;
use crate::state::machine::PipelineStateMachine;
use cp_protocol::GenerationParams;
use std::path::Path;

/// Directory holding the engine configuration, relative to the project root.
pub const CONFIG_DIR: &str = ".content-pipeline";

/// Loads the engine configuration from `.content-pipeline/config.toml`.
///
/// # Arguments
///
/// * `root` - Root directory containing the `.content-pipeline/` folder
///
/// # Returns
///
/// An `EngineConfig`. A missing directory or file yields the defaults. A
/// relative storage path is resolved against `root`.
///
/// # Errors
///
/// Returns `ConfigError` if:
/// - The file exists but cannot be read
/// - The file is not valid TOML
/// - A checkpoint stage is not an awaiting-input stage, the process limit is
///   zero, or the backoff multiplier is below 1
///
/// # Example
///
/// ```rust,no_run
/// use cp_core::config::loader::load_config;
/// use std::path::Path;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = load_config(Path::new(".")).await?;
/// println!("Checkpoints: {:?}", config.checkpoint_stages);
/// # Ok(())
/// # }
/// ```
pub async fn load_config(root: &Path) -> ConfigResult<EngineConfig> {
    let config_path = root.join(CONFIG_DIR).join("config.toml");

    let mut config = if config_path.exists() {
        let content = tokio::fs::read_to_string(&config_path)
            .await
            .map_err(|source| ConfigError::FileRead {
                path: config_path.clone(),
                source,
            })?;
        toml::from_str::<EngineConfig>(&content).map_err(|source| ConfigError::TomlParse {
            path: config_path.clone(),
            source,
        })?
    } else {
        EngineConfig::default()
    };

    validate_config(&config).map_err(|reason| ConfigError::InvalidConfig {
        path: config_path,
        reason,
    })?;

    if config.storage.path.is_relative() {
        config.storage.path = root.join(&config.storage.path);
    }
    Ok(config)
}

/// Checks values the type system cannot.
pub fn validate_config(config: &EngineConfig) -> Result<(), String> {
    let machine = PipelineStateMachine::new();
    if let Some(stage) = config
        .checkpoint_stages
        .iter()
        .find(|stage| !machine.is_awaiting_input(**stage))
    {
        return Err(format!(
            "checkpoint stage '{stage}' is not an awaiting-input stage"
        ));
    }
    if config.max_active_processes == 0 {
        return Err("max_active_processes must be at least 1".to_string());
    }
    if config.retry.backoff_multiplier < 1.0 {
        return Err("retry.backoff_multiplier must be at least 1.0".to_string());
    }
    Ok(())
}

/// Loads run parameters from a YAML or JSON file (chosen by extension).
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read or parsed.
pub async fn load_params(path: &Path) -> ConfigResult<GenerationParams> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;

    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    if is_json {
        serde_json::from_str(&content).map_err(|source| ConfigError::JsonParse {
            path: path.to_path_buf(),
            source,
        })
    } else {
        serde_yaml::from_str(&content).map_err(|source| ConfigError::YamlParse {
            path: path.to_path_buf(),
            source,
        })
    }
}
