//! Wire codec for the interactive protocol.
//!
//! Everything that fails here is a protocol error: the message never reaches
//! validation and the process state is left untouched.

use crate::error::{EngineError, EngineResult};
use cp_protocol::{
    ApprovalPayload, EditAndProceedPayload, Event, InteractionResponse, SelectPersonaPayload,
    SelectThemePayload, UserInputType, WireMessage,
};
use serde::de::DeserializeOwned;
use serde_json::Value;

fn protocol(message: impl Into<String>) -> EngineError {
    EngineError::Protocol(message.into())
}

fn payload<T: DeserializeOwned>(response_type: UserInputType, value: Value) -> EngineResult<T> {
    serde_json::from_value(value)
        .map_err(|e| protocol(format!("malformed {response_type} payload: {e}")))
}

/// Decode the payload of a client response according to its declared type.
pub fn decode_payload(
    response_type: UserInputType,
    value: Value,
) -> EngineResult<InteractionResponse> {
    if !value.is_object() {
        return Err(protocol(format!(
            "{response_type} payload must be a JSON object"
        )));
    }
    match response_type {
        UserInputType::SelectPersona => payload::<SelectPersonaPayload>(response_type, value)
            .map(InteractionResponse::SelectPersona),
        UserInputType::SelectTheme => payload::<SelectThemePayload>(response_type, value)
            .map(InteractionResponse::SelectTheme),
        UserInputType::ApprovePlan => {
            payload::<ApprovalPayload>(response_type, value).map(InteractionResponse::ApprovePlan)
        }
        UserInputType::ApproveOutline => payload::<ApprovalPayload>(response_type, value)
            .map(InteractionResponse::ApproveOutline),
        UserInputType::Regenerate => Ok(InteractionResponse::regenerate()),
        UserInputType::EditAndProceed => {
            let edit: EditAndProceedPayload = payload(response_type, value)?;
            if !edit.edited_content.is_object() {
                return Err(protocol("edited_content must be a JSON object"));
            }
            Ok(InteractionResponse::EditAndProceed(edit))
        }
    }
}

/// Decode one raw client message.
///
/// # Errors
///
/// Returns `Protocol` for invalid JSON, an unknown envelope or response type,
/// a server event sent by a client, or a payload that does not match its
/// declared response type.
pub fn decode_wire(raw: &str) -> EngineResult<InteractionResponse> {
    let message: WireMessage =
        serde_json::from_str(raw).map_err(|e| protocol(format!("malformed envelope: {e}")))?;
    match message {
        WireMessage::ClientResponse {
            response_type,
            payload,
        } => decode_payload(response_type, payload),
        WireMessage::ServerEvent { .. } => Err(protocol("clients may only send client_response")),
    }
}

/// Encode a server event in its wire envelope.
pub fn encode_event(event: &Event) -> EngineResult<String> {
    serde_json::to_string(&WireMessage::server_event(event.clone()))
        .map_err(|e| EngineError::Internal(format!("failed to encode event: {e}")))
}

/// Encode a typed response in its wire envelope.
pub fn encode_response(response: &InteractionResponse) -> EngineResult<String> {
    serde_json::to_string(&WireMessage::client_response(response))
        .map_err(|e| EngineError::Internal(format!("failed to encode response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_decode_select_persona() {
        let raw = r#"{"type":"client_response","response_type":"select_persona","payload":{"selected_id":2}}"#;
        assert_eq!(
            decode_wire(raw).unwrap(),
            InteractionResponse::select_persona(2)
        );
    }

    #[test]
    fn test_negative_index_is_protocol_error() {
        let raw = r#"{"type":"client_response","response_type":"select_theme","payload":{"selected_index":-1}}"#;
        assert!(matches!(decode_wire(raw), Err(EngineError::Protocol(_))));
    }

    #[test]
    fn test_payload_must_match_declared_type() {
        let raw = r#"{"type":"client_response","response_type":"approve_plan","payload":{"selected_id":1}}"#;
        assert!(matches!(decode_wire(raw), Err(EngineError::Protocol(_))));
    }

    #[test]
    fn test_edited_content_must_be_object() {
        let raw = r#"{"type":"client_response","response_type":"edit_and_proceed","payload":{"edited_content":"text"}}"#;
        assert!(matches!(decode_wire(raw), Err(EngineError::Protocol(_))));
    }

    #[test]
    fn test_unknown_response_type_and_bad_json() {
        let unknown = r#"{"type":"client_response","response_type":"skip","payload":{}}"#;
        assert!(matches!(decode_wire(unknown), Err(EngineError::Protocol(_))));
        assert!(matches!(decode_wire("{not json"), Err(EngineError::Protocol(_))));
    }

    #[test]
    fn test_server_event_from_client_rejected() {
        let raw = encode_event(&Event::ProcessCompleted {
            process_id: Uuid::new_v4(),
        })
        .unwrap();
        assert!(raw.contains(r#""type":"server_event""#));
        assert!(raw.contains(r#""event_type":"process_completed""#));
        assert!(matches!(decode_wire(&raw), Err(EngineError::Protocol(_))));
    }

    #[test]
    fn test_encoded_response_decodes_back() {
        let response = InteractionResponse::edit_and_proceed(serde_json::json!({ "title": "t" }));
        let raw = encode_response(&response).unwrap();
        assert_eq!(decode_wire(&raw).unwrap(), response);
    }
}
