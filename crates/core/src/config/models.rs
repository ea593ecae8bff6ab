//! Engine configuration models.
//!
//! This module provides the unified `EngineConfig` structure read from
//! `.content-pipeline/config.toml`. Every section has defaults, so an empty or
//! missing file yields a usable configuration.

use crate::engine::auto_decision::AutoModeSettings;
use crate::logging::LoggingConfig;
use cp_protocol::Stage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration loaded from `.content-pipeline/config.toml`.
///
/// # Example
///
/// ```toml
/// max_active_processes = 4
/// checkpoint_stages = ["persona_selection", "theme_selection", "outline_approval"]
///
/// [retry]
/// max_retries = 3
/// initial_backoff_ms = 500
///
/// [auto]
/// persona_strategy = "best_match"
/// theme_strategy = "first"
/// min_outline_sections = 3
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub retry: RetryConfig,

    /// Awaiting-input stages at which a snapshot is captured.
    #[serde(default = "default_checkpoint_stages")]
    pub checkpoint_stages: Vec<Stage>,

    /// Upper bound on runs doing work at the same time. Runs that are paused
    /// or waiting for a manual response do not count.
    #[serde(default = "default_max_active_processes")]
    pub max_active_processes: usize,

    /// Defaults for auto-mode runs. `min_outline_sections` also applies to
    /// manual outline approval.
    #[serde(default)]
    pub auto: AutoModeSettings,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

pub fn default_checkpoint_stages() -> Vec<Stage> {
    vec![
        Stage::PersonaSelection,
        Stage::ThemeSelection,
        Stage::OutlineApproval,
    ]
}

fn default_max_active_processes() -> usize {
    16
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            checkpoint_stages: default_checkpoint_stages(),
            max_active_processes: default_max_active_processes(),
            auto: AutoModeSettings::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Retry policy for transient capability failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryConfig {
    /// No retries and no waiting.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_backoff_ms: 0,
            backoff_multiplier: 1.0,
            max_backoff_ms: 0,
        }
    }

    /// Backoff before retry number `attempt` (0-based).
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let millis = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped = millis.min(self.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

/// Where process rows and snapshots are stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Sled database directory, relative to the project root unless absolute.
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from(".content-pipeline/data")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let retry = RetryConfig {
            max_retries: 5,
            initial_backoff_ms: 100,
            backoff_multiplier: 2.0,
            max_backoff_ms: 500,
        };
        assert_eq!(retry.backoff_for_attempt(0), Duration::from_millis(100));
        assert_eq!(retry.backoff_for_attempt(1), Duration::from_millis(200));
        assert_eq!(retry.backoff_for_attempt(2), Duration::from_millis(400));
        assert_eq!(retry.backoff_for_attempt(3), Duration::from_millis(500));
        assert_eq!(retry.backoff_for_attempt(10), Duration::from_millis(500));
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.checkpoint_stages.len(), 3);
        assert_eq!(config.retry.max_retries, 3);
        assert!(config.max_active_processes > 0);
        assert_eq!(RetryConfig::none().backoff_for_attempt(4), Duration::ZERO);
    }
}
