//! State management for generation processes.
//!
//! This module provides:
//! - The pipeline state machine (transition table and stage kinds)
//! - The persisted process row and its lifecycle transitions
//! - ExecutionManager for coordinating concurrent runs

pub mod machine;
pub mod manager;
pub mod process;
