//! Logging setup.
//!
//! Structured logging through `tracing`. The binary calls [`init_logging`]
//! once; library code only uses the `tracing` macros.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Environment variable overriding the configured filter.
pub const LOG_ENV_VAR: &str = "CONTENT_PIPELINE_LOG";

/// Logging configuration, the `[logging]` section of `config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error, off
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: json or text
    #[serde(default = "default_format")]
    pub format: String,

    /// Colored output (text format only)
    #[serde(default = "default_true")]
    pub color: bool,

    /// Per-module levels, e.g. `cp_core::engine = "debug"`
    #[serde(default)]
    pub modules: BTreeMap<String, String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_format() -> String {
    "text".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_format(),
            color: default_true(),
            modules: BTreeMap::new(),
        }
    }
}

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Invalid log format: {0} (must be 'json' or 'text')")]
    InvalidFormat(String),

    #[error("Invalid log directive '{directive}': {reason}")]
    InvalidDirective { directive: String, reason: String },

    #[error("Failed to install subscriber: {0}")]
    Init(String),
}

/// Initialize the global subscriber.
///
/// Priority: the `CONTENT_PIPELINE_LOG` environment variable, then the
/// configured level and module directives. Logs go to stderr so command
/// output on stdout stays clean.
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = build_env_filter(config)?;
    let registry = Registry::default().with(filter);

    match config.format.as_str() {
        "json" => registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_writer(std::io::stderr),
            )
            .try_init()
            .map_err(|e| LoggingError::Init(e.to_string())),
        "text" => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(config.color)
                    .with_writer(std::io::stderr),
            )
            .try_init()
            .map_err(|e| LoggingError::Init(e.to_string())),
        other => Err(LoggingError::InvalidFormat(other.to_string())),
    }
}

/// Build the filter from the environment or the configuration.
pub fn build_env_filter(config: &LoggingConfig) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_env(LOG_ENV_VAR) {
        return Ok(filter);
    }

    if config.level == "off" {
        return Ok(EnvFilter::new("off"));
    }

    let mut filter = EnvFilter::new(&config.level);
    for (module, level) in &config.modules {
        let directive = format!("{module}={level}");
        let parsed = directive
            .parse()
            .map_err(|e: tracing_subscriber::filter::ParseError| LoggingError::InvalidDirective {
                directive: directive.clone(),
                reason: e.to_string(),
            })?;
        filter = filter.add_directive(parsed);
    }
    Ok(filter)
}
