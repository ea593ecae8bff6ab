//! Interaction request/response models.
//!
//! When a run reaches an awaiting-input stage the core emits an
//! [`InteractionRequest`]. A client (or an auto-decision function) answers with
//! an [`InteractionResponse`] whose `response_type` must be one the request
//! accepts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use ts_rs::TS;
use uuid::Uuid;

use crate::artifact_models::{FlatSection, Outline, Persona, ResearchPlan, Theme};
use crate::stage_models::Stage;

/// Kind of input a user can provide.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, TS)]
#[serde(rename_all = "snake_case")]
pub enum UserInputType {
    SelectPersona,
    SelectTheme,
    ApprovePlan,
    ApproveOutline,
    /// Discard the artifact under review and run its generation stage again.
    Regenerate,
    /// Replace the artifact under review with user-edited content and proceed.
    EditAndProceed,
}

impl UserInputType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserInputType::SelectPersona => "select_persona",
            UserInputType::SelectTheme => "select_theme",
            UserInputType::ApprovePlan => "approve_plan",
            UserInputType::ApproveOutline => "approve_outline",
            UserInputType::Regenerate => "regenerate",
            UserInputType::EditAndProceed => "edit_and_proceed",
        }
    }
}

impl fmt::Display for UserInputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of `select_persona`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct SelectPersonaPayload {
    pub selected_id: u32,
}

/// Payload of `select_theme`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct SelectThemePayload {
    pub selected_index: u32,
}

/// Payload of `approve_plan` and `approve_outline`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct ApprovalPayload {
    pub approved: bool,
}

/// Payload of `regenerate`; always `{}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default, TS)]
pub struct RegeneratePayload {}

/// Payload of `edit_and_proceed`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct EditAndProceedPayload {
    /// JSON object shaped like the artifact under review.
    pub edited_content: serde_json::Value,
}

/// A typed response to an interaction request.
///
/// Serialized as `{"response_type": "...", "payload": {...}}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
#[serde(tag = "response_type", content = "payload", rename_all = "snake_case")]
pub enum InteractionResponse {
    SelectPersona(SelectPersonaPayload),
    SelectTheme(SelectThemePayload),
    ApprovePlan(ApprovalPayload),
    ApproveOutline(ApprovalPayload),
    Regenerate(RegeneratePayload),
    EditAndProceed(EditAndProceedPayload),
}

impl InteractionResponse {
    pub fn response_type(&self) -> UserInputType {
        match self {
            InteractionResponse::SelectPersona(_) => UserInputType::SelectPersona,
            InteractionResponse::SelectTheme(_) => UserInputType::SelectTheme,
            InteractionResponse::ApprovePlan(_) => UserInputType::ApprovePlan,
            InteractionResponse::ApproveOutline(_) => UserInputType::ApproveOutline,
            InteractionResponse::Regenerate(_) => UserInputType::Regenerate,
            InteractionResponse::EditAndProceed(_) => UserInputType::EditAndProceed,
        }
    }

    pub fn select_persona(selected_id: u32) -> Self {
        InteractionResponse::SelectPersona(SelectPersonaPayload { selected_id })
    }

    pub fn select_theme(selected_index: u32) -> Self {
        InteractionResponse::SelectTheme(SelectThemePayload { selected_index })
    }

    pub fn approve_plan(approved: bool) -> Self {
        InteractionResponse::ApprovePlan(ApprovalPayload { approved })
    }

    pub fn approve_outline(approved: bool) -> Self {
        InteractionResponse::ApproveOutline(ApprovalPayload { approved })
    }

    pub fn regenerate() -> Self {
        InteractionResponse::Regenerate(RegeneratePayload {})
    }

    pub fn edit_and_proceed(edited_content: serde_json::Value) -> Self {
        InteractionResponse::EditAndProceed(EditAndProceedPayload { edited_content })
    }
}

/// Data a client needs to render an interaction request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
#[serde(tag = "data_type", rename_all = "snake_case")]
pub enum RequestData {
    PersonaChoices { personas: Vec<Persona> },
    ThemeChoices { themes: Vec<Theme> },
    PlanReview { plan: ResearchPlan },
    OutlineReview {
        outline: Outline,
        writing_order: Vec<FlatSection>,
    },
}

/// The single outstanding question a run is waiting on.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct InteractionRequest {
    #[ts(type = "string")]
    pub request_id: Uuid,

    #[ts(type = "string")]
    pub process_id: Uuid,

    /// The awaiting-input stage that raised this request.
    pub stage: Stage,

    /// Primary kind of input expected.
    pub kind: UserInputType,

    /// Every response type this request accepts, primary kind first.
    pub accepted: Vec<UserInputType>,

    pub data: RequestData,

    #[ts(type = "string")]
    pub created_at: DateTime<Utc>,
}

impl InteractionRequest {
    /// Whether a response of the given type answers this request.
    pub fn accepts(&self, response_type: UserInputType) -> bool {
        self.accepted.contains(&response_type)
    }
}
