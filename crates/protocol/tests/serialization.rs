use cp_protocol::*;
use serde_json::json;
use uuid::Uuid;

#[test]
fn test_generation_params_from_yaml() {
    let yaml_str = r#"
keywords:
  - "札幌"
  - "注文住宅"
target_audience: "first-time home builders"
persona_count: 4
"#;

    let params: GenerationParams =
        serde_yaml::from_str(yaml_str).expect("Failed to deserialize GenerationParams");

    assert_eq!(params.keywords, vec!["札幌", "注文住宅"]);
    assert_eq!(params.target_audience.as_deref(), Some("first-time home builders"));
    assert_eq!(params.target_length, None);
    assert_eq!(params.persona_count, 4);
    // Omitted counts fall back to the default.
    assert_eq!(params.theme_count, 3);
}

#[test]
fn test_stage_wire_names() {
    for stage in Stage::ALL {
        let json = serde_json::to_value(stage).expect("Failed to serialize Stage");
        assert_eq!(json, stage.as_str());
        let back: Stage = serde_json::from_value(json).expect("Failed to deserialize Stage");
        assert_eq!(back, stage);
    }
    assert_eq!(
        serde_json::to_value(Stage::PersonaSelection).unwrap(),
        "persona_selection"
    );
}

#[test]
fn test_process_status_serialization() {
    let json = serde_json::to_value(ProcessStatus::AwaitingInput).unwrap();
    assert_eq!(json, "awaiting_input");
    assert_eq!(json, ProcessStatus::AwaitingInput.as_str());

    let deserialized: ProcessStatus = serde_json::from_value(json).unwrap();
    assert_eq!(deserialized, ProcessStatus::AwaitingInput);
    assert!(ProcessStatus::Cancelled.is_terminal());
    assert!(!ProcessStatus::Paused.is_terminal());
}

#[test]
fn test_interaction_response_shape() {
    let json = serde_json::to_value(InteractionResponse::select_theme(2)).unwrap();
    assert_eq!(
        json,
        json!({ "response_type": "select_theme", "payload": { "selected_index": 2 } })
    );

    let regenerate = serde_json::to_value(InteractionResponse::regenerate()).unwrap();
    assert_eq!(regenerate, json!({ "response_type": "regenerate", "payload": {} }));

    let edited: InteractionResponse = serde_json::from_value(json!({
        "response_type": "edit_and_proceed",
        "payload": { "edited_content": { "title": "New", "description": "" } }
    }))
    .unwrap();
    assert_eq!(edited.response_type(), UserInputType::EditAndProceed);
}

#[test]
fn test_wire_envelopes() {
    let process_id = Uuid::new_v4();
    let event = Event::ProcessStatusUpdate {
        process_id,
        status: ProcessStatus::Running,
        stage: Stage::KeywordAnalysis,
    };
    let json = serde_json::to_value(WireMessage::server_event(event.clone())).unwrap();
    assert_eq!(json["type"], "server_event");
    assert_eq!(json["payload"]["event_type"], "process_status_update");
    assert_eq!(json["payload"]["stage"], "keyword_analysis");

    let back: WireMessage = serde_json::from_value(json).unwrap();
    assert_eq!(back, WireMessage::server_event(event));

    let client = WireMessage::client_response(&InteractionResponse::approve_outline(true));
    let json = serde_json::to_value(&client).unwrap();
    assert_eq!(
        json,
        json!({
            "type": "client_response",
            "response_type": "approve_outline",
            "payload": { "approved": true }
        })
    );
}

#[test]
fn test_interaction_request_round_trip() {
    let request = InteractionRequest {
        request_id: Uuid::new_v4(),
        process_id: Uuid::new_v4(),
        stage: Stage::PersonaSelection,
        kind: UserInputType::SelectPersona,
        accepted: vec![
            UserInputType::SelectPersona,
            UserInputType::Regenerate,
            UserInputType::EditAndProceed,
        ],
        data: RequestData::PersonaChoices {
            personas: vec![Persona {
                id: 3,
                name: "Hokkaido family".to_string(),
                description: "Building in 札幌".to_string(),
            }],
        },
        created_at: chrono::Utc::now(),
    };

    let json = serde_json::to_value(&request).unwrap();
    assert_eq!(json["data"]["data_type"], "persona_choices");
    assert_eq!(json["accepted"][1], "regenerate");

    let back: InteractionRequest = serde_json::from_value(json).unwrap();
    assert_eq!(back, request);
    assert!(back.accepts(UserInputType::Regenerate));
    assert!(!back.accepts(UserInputType::ApprovePlan));
}

#[test]
fn test_event_process_id() {
    let process_id = Uuid::new_v4();
    let events = [
        Event::ProcessCompleted { process_id },
        Event::ProcessCancelled { process_id },
        Event::SnapshotSaved {
            process_id,
            snapshot_id: Uuid::new_v4(),
            stage: Stage::ThemeSelection,
        },
        Event::DecisionApplied {
            process_id,
            stage: Stage::PlanApproval,
            response_type: UserInputType::ApprovePlan,
            automated: true,
            reason: Some("research plan with 2 queries approved".to_string()),
        },
    ];
    for event in events {
        assert_eq!(event.process_id(), process_id);
    }
}

#[test]
fn test_process_state_optional_fields_default() {
    let json = json!({
        "process_id": Uuid::new_v4(),
        "owner_id": "user-1",
        "status": "paused",
        "current_step": "theme_selection",
        "current_step_label": "Theme selection",
        "progress_percentage": 33,
        "is_waiting_for_input": false,
        "current_snapshot_id": null,
        "step_history": []
    });

    let state: ProcessState = serde_json::from_value(json).unwrap();
    assert_eq!(state.pause_reason, None);
    assert!(state.pending_request.is_none());
    assert!(state.error.is_none());
    assert!(state.is_settled());
}
