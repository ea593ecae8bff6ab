//! Runtime process state models.
//!
//! This module defines the structures clients use to observe a running
//! generation process: its status, step history and snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use ts_rs::TS;
use uuid::Uuid;

use crate::interaction_models::InteractionRequest;
use crate::stage_models::Stage;

/// Lifecycle status of a generation process.
///
/// Normal progression: Running -> AwaitingInput -> Running -> ... -> Completed
///
/// Special states:
/// - Paused: suspended by request, by a lost client connection, or by a restart
/// - Error: a stage failed with no local recovery
/// - Cancelled: stopped by an explicit cancel
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, TS)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Running,
    Paused,
    AwaitingInput,
    Completed,
    Error,
    Cancelled,
}

impl ProcessStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessStatus::Completed | ProcessStatus::Error | ProcessStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Running => "running",
            ProcessStatus::Paused => "paused",
            ProcessStatus::AwaitingInput => "awaiting_input",
            ProcessStatus::Completed => "completed",
            ProcessStatus::Error => "error",
            ProcessStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a process is paused.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, TS)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    /// `pause` was called.
    Requested,
    /// The interaction channel disconnected while a request was outstanding.
    ConnectionLost,
    /// The hosting process stopped while the run was live.
    Interrupted,
}

/// What happened in one step-history entry.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, TS)]
#[serde(rename_all = "snake_case")]
pub enum StepEvent {
    Entered,
    Completed,
    AwaitingInput,
    Decided,
    Paused,
    Resumed,
    Restored,
    Failed,
    Cancelled,
}

/// One entry of the ordered step history.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct StepRecord {
    pub stage: Stage,
    pub event: StepEvent,
    #[serde(default)]
    pub detail: Option<String>,
    #[ts(type = "string")]
    pub recorded_at: DateTime<Utc>,
}

/// Failure recorded when a process enters `error`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct StageFailureInfo {
    /// Stage that failed.
    pub stage: Stage,
    pub message: String,
}

/// Client-facing view of a process.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct ProcessState {
    #[ts(type = "string")]
    pub process_id: Uuid,
    pub owner_id: String,
    pub status: ProcessStatus,
    pub current_step: Stage,
    pub current_step_label: String,
    pub progress_percentage: u8,
    pub is_waiting_for_input: bool,
    #[serde(default)]
    pub pause_reason: Option<PauseReason>,
    #[serde(default)]
    pub pending_request: Option<InteractionRequest>,
    #[serde(default)]
    pub error: Option<StageFailureInfo>,
    #[ts(type = "string | null")]
    pub current_snapshot_id: Option<Uuid>,
    pub step_history: Vec<StepRecord>,
}

impl ProcessState {
    /// A state is settled once the run is no longer making autonomous progress.
    pub fn is_settled(&self) -> bool {
        self.status != ProcessStatus::Running
    }
}

/// Listing entry of a saved snapshot.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct SnapshotMeta {
    #[ts(type = "string")]
    pub snapshot_id: Uuid,
    #[ts(type = "string")]
    pub process_id: Uuid,
    #[ts(type = "string")]
    pub branch_id: Uuid,
    pub stage: Stage,
    #[ts(type = "string")]
    pub created_at: DateTime<Utc>,
}
