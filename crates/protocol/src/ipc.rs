//! Interactive wire protocol.
//!
//! Two envelopes travel over an interaction channel:
//! - server events, core to client:
//!   `{"type": "server_event", "payload": {"event_type": "...", ...}}`
//! - client responses, client to core:
//!   `{"type": "client_response", "response_type": "...", "payload": {...}}`
//!
//! The client-response payload is carried as raw JSON here and decoded per
//! [`UserInputType`] by the core, so a malformed payload is reported against
//! the response type it claimed to be.

use serde::{Deserialize, Serialize};
use ts_rs::TS;
use uuid::Uuid;

use crate::interaction_models::{InteractionRequest, InteractionResponse, UserInputType};
use crate::process_models::ProcessStatus;
use crate::stage_models::Stage;

/// Events sent from the core to clients.
///
/// Internally tagged by `event_type`:
/// ```json
/// {
///   "event_type": "process_status_update",
///   "process_id": "uuid-here",
///   "status": "awaiting_input",
///   "stage": "theme_selection"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum Event {
    /// A new process has been started.
    ProcessStarted {
        #[ts(type = "string")]
        process_id: Uuid,
        owner_id: String,
        auto_mode: bool,
    },

    /// A stage became the active stage.
    StageStarted {
        #[ts(type = "string")]
        process_id: Uuid,
        stage: Stage,
        progress_percentage: u8,
    },

    /// An autonomous stage produced a validated artifact.
    StageCompleted {
        #[ts(type = "string")]
        process_id: Uuid,
        stage: Stage,
    },

    /// A process's status has changed.
    ProcessStatusUpdate {
        #[ts(type = "string")]
        process_id: Uuid,
        status: ProcessStatus,
        stage: Stage,
    },

    /// The process is waiting for this request to be answered.
    InteractionRequested {
        #[ts(type = "string")]
        process_id: Uuid,
        request: InteractionRequest,
    },

    /// A response was validated and applied.
    DecisionApplied {
        #[ts(type = "string")]
        process_id: Uuid,
        stage: Stage,
        response_type: UserInputType,
        automated: bool,
        reason: Option<String>,
    },

    /// A checkpoint snapshot was saved.
    SnapshotSaved {
        #[ts(type = "string")]
        process_id: Uuid,
        #[ts(type = "string")]
        snapshot_id: Uuid,
        stage: Stage,
    },

    /// A process has completed successfully.
    ProcessCompleted {
        #[ts(type = "string")]
        process_id: Uuid,
    },

    /// A process has entered `error`.
    ProcessError {
        #[ts(type = "string")]
        process_id: Uuid,
        stage: Stage,
        error: String,
    },

    /// A process was cancelled by user request.
    ProcessCancelled {
        #[ts(type = "string")]
        process_id: Uuid,
    },
}

impl Event {
    /// Process the event belongs to.
    pub fn process_id(&self) -> Uuid {
        match self {
            Event::ProcessStarted { process_id, .. }
            | Event::StageStarted { process_id, .. }
            | Event::StageCompleted { process_id, .. }
            | Event::ProcessStatusUpdate { process_id, .. }
            | Event::InteractionRequested { process_id, .. }
            | Event::DecisionApplied { process_id, .. }
            | Event::SnapshotSaved { process_id, .. }
            | Event::ProcessCompleted { process_id }
            | Event::ProcessError { process_id, .. }
            | Event::ProcessCancelled { process_id } => *process_id,
        }
    }
}

/// Envelope of every message on an interaction channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    ServerEvent {
        payload: Event,
    },
    ClientResponse {
        response_type: UserInputType,
        payload: serde_json::Value,
    },
}

impl WireMessage {
    pub fn server_event(event: Event) -> Self {
        WireMessage::ServerEvent { payload: event }
    }

    /// Wrap a typed response in a client envelope.
    pub fn client_response(response: &InteractionResponse) -> Self {
        let payload = match response {
            InteractionResponse::SelectPersona(p) => serde_json::json!({ "selected_id": p.selected_id }),
            InteractionResponse::SelectTheme(p) => serde_json::json!({ "selected_index": p.selected_index }),
            InteractionResponse::ApprovePlan(p) | InteractionResponse::ApproveOutline(p) => {
                serde_json::json!({ "approved": p.approved })
            }
            InteractionResponse::Regenerate(_) => serde_json::json!({}),
            InteractionResponse::EditAndProceed(p) => {
                serde_json::json!({ "edited_content": p.edited_content })
            }
        };
        WireMessage::ClientResponse {
            response_type: response.response_type(),
            payload,
        }
    }
}
