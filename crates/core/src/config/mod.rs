//! Configuration loading and management.
//!
//! This module provides functionality to load the engine configuration from
//! the `.content-pipeline/` directory and run parameters from YAML or JSON.

pub mod error;
pub mod loader;
pub mod models;

pub use error::{ConfigError, ConfigResult};
pub use models::{EngineConfig, RetryConfig, StorageConfig};
