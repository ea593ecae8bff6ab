//! # cp-protocol
//!
//! Core protocol definitions and data models for content-pipeline.
//!
//! This crate defines all shared data structures used for:
//! - Pipeline stages and their artifacts
//! - Runtime process state and step history
//! - The interactive request/response protocol between clients and the core
//!
//! ## Modules
//!
//! - [`stage_models`]: Stage identifiers
//! - [`artifact_models`]: Artifacts produced by each stage
//! - [`interaction_models`]: Interaction requests and typed responses
//! - [`process_models`]: Runtime process state, status and snapshots
//! - [`ipc`]: Server events and the wire envelope
//!
//! ## Design Principles
//!
//! - Minimal dependencies: Only serde, ts-rs, uuid and chrono
//! - TypeScript generation: All types derive `TS` for client compatibility
//! - Independent compilation: No dependencies on other content-pipeline crates

pub mod artifact_models;
pub mod interaction_models;
pub mod ipc;
pub mod process_models;
pub mod stage_models;

// Re-export all public types for convenience
pub use artifact_models::*;
pub use interaction_models::*;
pub use ipc::*;
pub use process_models::*;
pub use stage_models::*;
