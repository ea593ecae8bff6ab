//! Generation process lifecycle.
//!
//! This module provides the persisted process row and the functions that move
//! it through its lifecycle. Every function mutates the row in place and
//! returns the events to emit once the row has been written; callers apply them
//! inside an optimistic update, so they must stay free of side effects.

use crate::context::GenerationContext;
use crate::engine::auto_decision::AutoModeSettings;
use crate::state::machine::PipelineStateMachine;
use chrono::{DateTime, Utc};
use cp_protocol::{
    Event, GenerationParams, InteractionRequest, PauseReason, ProcessState, ProcessStatus, Stage,
    StageFailureInfo, StepEvent, StepRecord, UserInputType,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One pipeline run, as stored by the persistence gateway.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GenerationProcess {
    pub id: Uuid,
    pub owner_id: String,
    pub status: ProcessStatus,
    pub current_stage: Stage,
    pub current_step_label: String,
    pub progress_percentage: u8,
    pub is_waiting_for_input: bool,
    /// Branch this run is on. Restoring a snapshot starts a new branch.
    pub branch_id: Uuid,
    #[serde(default)]
    pub current_snapshot_id: Option<Uuid>,
    #[serde(default)]
    pub pause_reason: Option<PauseReason>,
    /// The single outstanding request while at an awaiting-input stage.
    #[serde(default)]
    pub pending_request: Option<InteractionRequest>,
    /// Present when the run decides on its own at awaiting-input stages.
    #[serde(default)]
    pub auto: Option<AutoModeSettings>,
    pub context: GenerationContext,
    pub step_history: Vec<StepRecord>,
    #[serde(default)]
    pub error: Option<StageFailureInfo>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic concurrency counter, bumped by every successful write.
    pub version: u64,
}

impl GenerationProcess {
    pub fn is_auto(&self) -> bool {
        self.auto.is_some()
    }

    /// Client-facing view of the row.
    pub fn state(&self) -> ProcessState {
        ProcessState {
            process_id: self.id,
            owner_id: self.owner_id.clone(),
            status: self.status,
            current_step: self.current_stage,
            current_step_label: self.current_step_label.clone(),
            progress_percentage: self.progress_percentage,
            is_waiting_for_input: self.is_waiting_for_input,
            pause_reason: self.pause_reason,
            pending_request: self.pending_request.clone(),
            error: self.error.clone(),
            current_snapshot_id: self.current_snapshot_id,
            step_history: self.step_history.clone(),
        }
    }

    fn status_event(&self) -> Event {
        Event::ProcessStatusUpdate {
            process_id: self.id,
            status: self.status,
            stage: self.current_stage,
        }
    }

    fn set_status(&mut self, status: ProcessStatus) {
        self.status = status;
        self.is_waiting_for_input = status == ProcessStatus::AwaitingInput;
    }

    fn set_stage(&mut self, stage: Stage) {
        let machine = PipelineStateMachine::new();
        self.current_stage = stage;
        self.current_step_label = stage.label().to_string();
        if let Some(progress) = machine.progress_percentage(stage) {
            self.progress_percentage = progress;
        }
    }
}

/// Create a new process positioned at `start`.
///
/// # Arguments
///
/// * `owner_id` - Identity of the caller, recorded as given
/// * `params` - Requested run parameters
/// * `auto` - Auto-mode settings, `None` for an interactive run
pub fn create_process(
    owner_id: String,
    params: GenerationParams,
    auto: Option<AutoModeSettings>,
) -> GenerationProcess {
    let now = Utc::now();
    let mut process = GenerationProcess {
        id: Uuid::new_v4(),
        owner_id,
        status: ProcessStatus::Running,
        current_stage: Stage::Start,
        current_step_label: String::new(),
        progress_percentage: 0,
        is_waiting_for_input: false,
        branch_id: Uuid::new_v4(),
        current_snapshot_id: None,
        pause_reason: None,
        pending_request: None,
        auto,
        context: GenerationContext::new(params),
        step_history: Vec::new(),
        error: None,
        created_at: now,
        updated_at: now,
        version: 0,
    };
    process.set_stage(Stage::Start);
    process
}

/// Append an entry to the step history.
pub fn record_step(
    process: &mut GenerationProcess,
    stage: Stage,
    event: StepEvent,
    detail: Option<String>,
) {
    process.step_history.push(StepRecord {
        stage,
        event,
        detail,
        recorded_at: Utc::now(),
    });
}

/// Move to `stage` and mark the run as running.
pub fn enter_stage(process: &mut GenerationProcess, stage: Stage) -> Vec<Event> {
    process.set_stage(stage);
    process.set_status(ProcessStatus::Running);
    process.pause_reason = None;
    record_step(process, stage, StepEvent::Entered, None);
    vec![Event::StageStarted {
        process_id: process.id,
        stage,
        progress_percentage: process.progress_percentage,
    }]
}

/// Record that an autonomous stage committed its artifact.
pub fn complete_stage(process: &mut GenerationProcess, stage: Stage) -> Vec<Event> {
    record_step(process, stage, StepEvent::Completed, None);
    vec![Event::StageCompleted {
        process_id: process.id,
        stage,
    }]
}

/// Park the run at an awaiting-input stage with `request` outstanding.
///
/// Re-issuing the same request (same id) after a restart or reattach does not
/// add another history entry.
pub fn await_input(process: &mut GenerationProcess, request: InteractionRequest) -> Vec<Event> {
    let reissued = process
        .pending_request
        .as_ref()
        .is_some_and(|pending| pending.request_id == request.request_id);
    process.set_status(ProcessStatus::AwaitingInput);
    process.pause_reason = None;
    if !reissued {
        record_step(
            process,
            request.stage,
            StepEvent::AwaitingInput,
            Some(request.kind.to_string()),
        );
    }
    process.pending_request = Some(request.clone());
    vec![
        process.status_event(),
        Event::InteractionRequested {
            process_id: process.id,
            request,
        },
    ]
}

/// Consume the outstanding request after its response has been applied.
pub fn record_decision(
    process: &mut GenerationProcess,
    response_type: UserInputType,
    automated: bool,
    reason: Option<String>,
) -> Vec<Event> {
    let stage = process.current_stage;
    process.pending_request = None;
    process.set_status(ProcessStatus::Running);
    let detail = match &reason {
        Some(reason) => format!("{response_type} ({reason})"),
        None => response_type.to_string(),
    };
    record_step(process, stage, StepEvent::Decided, Some(detail));
    vec![Event::DecisionApplied {
        process_id: process.id,
        stage,
        response_type,
        automated,
        reason,
    }]
}

/// Transition to Paused. The outstanding request, if any, is kept.
pub fn pause_process(process: &mut GenerationProcess, reason: PauseReason) -> Vec<Event> {
    process.set_status(ProcessStatus::Paused);
    process.pause_reason = Some(reason);
    let detail = match reason {
        PauseReason::Requested => "requested",
        PauseReason::ConnectionLost => "connection lost",
        PauseReason::Interrupted => "interrupted",
    };
    let stage = process.current_stage;
    record_step(process, stage, StepEvent::Paused, Some(detail.to_string()));
    vec![process.status_event()]
}

/// Leave Paused: back to awaiting input when a request is outstanding,
/// otherwise running.
pub fn resume_process(process: &mut GenerationProcess) -> Vec<Event> {
    let status = if process.pending_request.is_some() {
        ProcessStatus::AwaitingInput
    } else {
        ProcessStatus::Running
    };
    process.set_status(status);
    process.pause_reason = None;
    let stage = process.current_stage;
    record_step(process, stage, StepEvent::Resumed, None);
    vec![process.status_event()]
}

/// Mark the process as completed.
pub fn complete_process(process: &mut GenerationProcess) -> Vec<Event> {
    process.set_stage(Stage::Completed);
    process.set_status(ProcessStatus::Completed);
    process.pending_request = None;
    record_step(process, Stage::Completed, StepEvent::Entered, None);
    vec![
        process.status_event(),
        Event::ProcessCompleted {
            process_id: process.id,
        },
    ]
}

/// Mark the process as failed at `stage`.
///
/// The message and originating stage are recorded in the context, in the
/// process error field and in the step history.
pub fn fail_process(process: &mut GenerationProcess, stage: Stage, message: String) -> Vec<Event> {
    process.context.record_error(stage, &message);
    process.error = Some(StageFailureInfo {
        stage,
        message: message.clone(),
    });
    record_step(process, stage, StepEvent::Failed, Some(message.clone()));
    process.set_stage(Stage::Error);
    process.set_status(ProcessStatus::Error);
    process.pending_request = None;
    process.pause_reason = None;
    vec![
        process.status_event(),
        Event::ProcessError {
            process_id: process.id,
            stage,
            error: message,
        },
    ]
}

/// Mark the process as cancelled.
pub fn cancel_process(process: &mut GenerationProcess) -> Vec<Event> {
    let stage = process.current_stage;
    record_step(process, stage, StepEvent::Cancelled, None);
    process.set_stage(Stage::Cancelled);
    process.set_status(ProcessStatus::Cancelled);
    process.pending_request = None;
    process.pause_reason = None;
    vec![
        process.status_event(),
        Event::ProcessCancelled {
            process_id: process.id,
        },
    ]
}

/// Reposition the process on a new branch from a captured context.
///
/// The process lands at the snapshot's awaiting-input stage with `request`
/// outstanding. Previous error information is cleared.
pub fn restore_process(
    process: &mut GenerationProcess,
    snapshot_id: Uuid,
    context: GenerationContext,
    request: InteractionRequest,
) -> Vec<Event> {
    let stage = request.stage;
    process.branch_id = Uuid::new_v4();
    process.current_snapshot_id = Some(snapshot_id);
    process.context = context;
    process.error = None;
    process.pending_request = None;
    process.set_stage(stage);
    record_step(
        process,
        stage,
        StepEvent::Restored,
        Some(format!("snapshot {snapshot_id}")),
    );
    await_input(process, request)
}
