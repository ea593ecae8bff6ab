//! Error taxonomy of the pipeline engine.
//!
//! Stage- and channel-level failures are handled where a local recovery exists
//! (retrying a capability call, rejecting a response without mutation). Only
//! the variants for which [`EngineError::escalates`] is true move a process to
//! the terminal `error` stage.

use crate::persistence::PersistenceError;
use crate::state::machine::Outcome;
use cp_protocol::{ProcessStatus, Stage};
use thiserror::Error;
use uuid::Uuid;

/// Errors returned by the engine, the manager and the interaction channel.
#[derive(Error, Debug)]
pub enum EngineError {
    /// An artifact or a response failed its schema or structural check.
    #[error("Validation failed at {stage}: {message}")]
    Validation { stage: Stage, message: String },

    /// The capability call kept failing after all retries, or failed permanently.
    #[error("Capability call failed at {stage} after {attempts} attempt(s): {message}")]
    Capability {
        stage: Stage,
        attempts: u32,
        message: String,
    },

    /// Response kind mismatch, stale response or malformed envelope.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The interaction channel used for this call is no longer attached.
    #[error("Interaction channel for process {0} is disconnected")]
    ConnectionLost(Uuid),

    #[error("Process {0} was cancelled")]
    Cancelled(Uuid),

    #[error("Process {0} not found")]
    ProcessNotFound(Uuid),

    #[error("Snapshot {0} not found")]
    SnapshotNotFound(Uuid),

    #[error("Cannot {operation} process {process_id} while it is {status}")]
    InvalidState {
        process_id: Uuid,
        status: ProcessStatus,
        operation: &'static str,
    },

    /// A stage was invoked before the context fields it depends on were set.
    #[error("Precondition violated at {stage}: {message}")]
    Precondition { stage: Stage, message: String },

    /// The transition table has no entry for this pair.
    #[error("No transition defined from {stage} on {outcome}")]
    InvalidTransition { stage: Stage, outcome: Outcome },

    #[error("Stage {0} is not a checkpoint stage")]
    NotCheckpointStage(Stage),

    #[error("Too many active processes (limit {0})")]
    CapacityExceeded(usize),

    #[error("Persistence error: {0}")]
    Persistence(PersistenceError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether this failure ends the run in the `error` stage.
    pub fn escalates(&self) -> bool {
        matches!(
            self,
            EngineError::Validation { .. }
                | EngineError::Capability { .. }
                | EngineError::Precondition { .. }
                | EngineError::InvalidTransition { .. }
        )
    }
}

impl From<PersistenceError> for EngineError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::NotFound(id) => EngineError::ProcessNotFound(id),
            other => EngineError::Persistence(other),
        }
    }
}

/// Type alias for Result with EngineError.
pub type EngineResult<T> = Result<T, EngineError>;
