//! # cp-core
//!
//! Core orchestration layer for content-pipeline.
//!
//! This crate provides:
//! - The pipeline state machine and the per-run generation context
//! - Stage execution with retry and backoff against a capability provider
//! - The interactive request/response channel and its wire codec
//! - Background execution of runs, with manual or automated decisions
//! - Checkpoint snapshots and restore onto new branches
//! - Configuration loading from the `.content-pipeline/` directory
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and management
//! - [`context`]: Generation context and outline helpers
//! - [`capability`]: Capability provider contract and inputs
//! - [`engine`]: Run loop, stage executor, validation and auto decisions
//! - [`interaction`]: Event bus, interaction channel and wire codec
//! - [`persistence`]: Persistence gateway (in-memory and sled)
//! - [`snapshot`]: Checkpoint snapshot store
//! - [`state`]: State machine, process lifecycle and execution manager
//! - [`telemetry`]: Observability sink
//! - [`logging`]: Subscriber setup for binaries

pub mod capability;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod interaction;
pub mod logging;
pub mod persistence;
pub mod snapshot;
pub mod state;
pub mod telemetry;

pub use error::{EngineError, EngineResult};
pub use state::manager::{ExecutionManager, StartRequest};
