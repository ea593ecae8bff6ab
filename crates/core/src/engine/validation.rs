//! Artifact checks and response validation.
//!
//! Both manual responses and auto-mode decisions pass through
//! [`validate_response`] and [`apply_decision`]; there is no other way to
//! settle an awaiting-input stage.

use crate::context::outline::check_structure;
use crate::context::GenerationContext;
use crate::error::{EngineError, EngineResult};
use crate::state::machine::Outcome;
use cp_protocol::{
    InteractionRequest, InteractionResponse, Outline, Persona, ResearchPlan, Stage, Theme,
};
use std::collections::HashSet;

/// A validated decision, ready to be applied to the context.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    SelectPersona(Persona),
    SelectTheme(Theme),
    ApprovePlan(ResearchPlan),
    ApproveOutline(Outline),
    Regenerate,
}

pub fn check_persona(persona: &Persona) -> Result<(), String> {
    if persona.name.trim().is_empty() {
        return Err(format!("persona {} has an empty name", persona.id));
    }
    Ok(())
}

pub fn check_personas(personas: &[Persona]) -> Result<(), String> {
    if personas.is_empty() {
        return Err("no persona candidates".to_string());
    }
    let mut seen = HashSet::new();
    for persona in personas {
        check_persona(persona)?;
        if !seen.insert(persona.id) {
            return Err(format!("duplicate persona id {}", persona.id));
        }
    }
    Ok(())
}

pub fn check_theme(theme: &Theme) -> Result<(), String> {
    if theme.title.trim().is_empty() {
        return Err("theme has an empty title".to_string());
    }
    Ok(())
}

pub fn check_themes(themes: &[Theme]) -> Result<(), String> {
    if themes.is_empty() {
        return Err("no theme candidates".to_string());
    }
    themes.iter().try_for_each(check_theme)
}

pub fn check_plan(plan: &ResearchPlan) -> Result<(), String> {
    if plan.queries.is_empty() {
        return Err("research plan has no queries".to_string());
    }
    if plan.queries.iter().any(|q| q.query.trim().is_empty()) {
        return Err("research plan has an empty query".to_string());
    }
    Ok(())
}

fn invalid(stage: Stage, message: impl Into<String>) -> EngineError {
    EngineError::Validation {
        stage,
        message: message.into(),
    }
}

fn decode_edit<T: serde::de::DeserializeOwned>(
    stage: Stage,
    content: &serde_json::Value,
) -> EngineResult<T> {
    serde_json::from_value(content.clone())
        .map_err(|e| invalid(stage, format!("edited content does not match the artifact: {e}")))
}

/// Validate `response` against the outstanding request and the context.
///
/// # Errors
///
/// - `Protocol` when there is no outstanding request or the response type is
///   not accepted by it. Nothing is changed in that case.
/// - `Validation` when the response is well-formed but semantically invalid:
///   an unknown persona id, a theme index out of range, edited content that
///   is not a valid artifact, or approval of a structurally invalid outline.
pub fn validate_response(
    request: Option<&InteractionRequest>,
    response: &InteractionResponse,
    context: &GenerationContext,
    min_outline_sections: usize,
) -> EngineResult<Decision> {
    let request = request
        .ok_or_else(|| EngineError::Protocol("no outstanding interaction request".to_string()))?;
    let response_type = response.response_type();
    if !request.accepts(response_type) {
        let accepted: Vec<&str> = request.accepted.iter().map(|t| t.as_str()).collect();
        return Err(EngineError::Protocol(format!(
            "response type '{response_type}' is not accepted at {}; expected one of [{}]",
            request.stage,
            accepted.join(", ")
        )));
    }

    let stage = request.stage;
    match response {
        InteractionResponse::SelectPersona(payload) => {
            let candidates = context.persona.candidates.as_deref().unwrap_or_default();
            candidates
                .iter()
                .find(|p| p.id == payload.selected_id)
                .cloned()
                .map(Decision::SelectPersona)
                .ok_or_else(|| {
                    invalid(
                        stage,
                        format!("persona id {} is not among the candidates", payload.selected_id),
                    )
                })
        }
        InteractionResponse::SelectTheme(payload) => {
            let candidates = context.theme.candidates.as_deref().unwrap_or_default();
            candidates
                .get(payload.selected_index as usize)
                .cloned()
                .map(Decision::SelectTheme)
                .ok_or_else(|| {
                    invalid(
                        stage,
                        format!(
                            "theme index {} is out of range ({} candidates)",
                            payload.selected_index,
                            candidates.len()
                        ),
                    )
                })
        }
        InteractionResponse::ApprovePlan(payload) => {
            if !payload.approved {
                return Ok(Decision::Regenerate);
            }
            let plan = context
                .research
                .plan
                .clone()
                .ok_or_else(|| invalid(stage, "no research plan to approve"))?;
            Ok(Decision::ApprovePlan(plan))
        }
        InteractionResponse::ApproveOutline(payload) => {
            if !payload.approved {
                return Ok(Decision::Regenerate);
            }
            let outline = context
                .outline
                .generated
                .clone()
                .ok_or_else(|| invalid(stage, "no outline to approve"))?;
            check_structure(&outline, min_outline_sections).map_err(|m| invalid(stage, m))?;
            Ok(Decision::ApproveOutline(outline))
        }
        InteractionResponse::Regenerate(_) => Ok(Decision::Regenerate),
        InteractionResponse::EditAndProceed(payload) => {
            let content = &payload.edited_content;
            match stage {
                Stage::PersonaSelection => {
                    let persona: Persona = decode_edit(stage, content)?;
                    check_persona(&persona).map_err(|m| invalid(stage, m))?;
                    Ok(Decision::SelectPersona(persona))
                }
                Stage::ThemeSelection => {
                    let theme: Theme = decode_edit(stage, content)?;
                    check_theme(&theme).map_err(|m| invalid(stage, m))?;
                    Ok(Decision::SelectTheme(theme))
                }
                Stage::PlanApproval => {
                    let plan: ResearchPlan = decode_edit(stage, content)?;
                    check_plan(&plan).map_err(|m| invalid(stage, m))?;
                    Ok(Decision::ApprovePlan(plan))
                }
                Stage::OutlineApproval => {
                    let outline: Outline = decode_edit(stage, content)?;
                    check_structure(&outline, min_outline_sections)
                        .map_err(|m| invalid(stage, m))?;
                    Ok(Decision::ApproveOutline(outline))
                }
                other => Err(EngineError::Protocol(format!(
                    "stage {other} does not accept edited content"
                ))),
            }
        }
    }
}

/// Apply a validated decision taken at `stage` and return the outcome to
/// feed the state machine.
pub fn apply_decision(
    context: &mut GenerationContext,
    stage: Stage,
    decision: Decision,
) -> EngineResult<Outcome> {
    match decision {
        Decision::SelectPersona(persona) => context.apply_persona(persona)?,
        Decision::SelectTheme(theme) => context.apply_theme(theme)?,
        Decision::ApprovePlan(plan) => context.apply_plan(plan)?,
        Decision::ApproveOutline(outline) => context.apply_outline(outline)?,
        Decision::Regenerate => {
            context.clear_for_regeneration(stage);
            return Ok(Outcome::Regenerate);
        }
    }
    Ok(Outcome::Approved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Artifact;
    use crate::interaction::request::build_request;
    use cp_protocol::{GenerationParams, OutlineSection};
    use serde_json::json;
    use uuid::Uuid;

    fn themed_context() -> GenerationContext {
        let mut context = GenerationContext::new(GenerationParams::default());
        context
            .commit(
                Stage::ThemeGeneration,
                Artifact::Themes(vec![
                    Theme {
                        title: "Winter".to_string(),
                        description: String::new(),
                        keywords: vec![],
                    },
                    Theme {
                        title: "Budget".to_string(),
                        description: String::new(),
                        keywords: vec![],
                    },
                ]),
            )
            .unwrap();
        context
    }

    fn outline(sections: usize) -> Outline {
        Outline {
            title: "Guide".to_string(),
            top_level_heading: 2,
            sections: (0..sections)
                .map(|i| OutlineSection {
                    heading: format!("Section {i}"),
                    level: 2,
                    description: String::new(),
                    subsections: vec![],
                })
                .collect(),
        }
    }

    #[test]
    fn test_mismatched_response_type_is_protocol_error() {
        let context = themed_context();
        let request = build_request(Stage::ThemeSelection, &context, Uuid::new_v4()).unwrap();
        let err = validate_response(
            Some(&request),
            &InteractionResponse::select_persona(0),
            &context,
            1,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Protocol(_)));
        assert!(!err.escalates());
    }

    #[test]
    fn test_stale_response_is_protocol_error() {
        let context = themed_context();
        let err = validate_response(None, &InteractionResponse::select_theme(0), &context, 1)
            .unwrap_err();
        assert!(matches!(err, EngineError::Protocol(_)));
    }

    #[test]
    fn test_theme_index_out_of_range_is_validation_error() {
        let context = themed_context();
        let request = build_request(Stage::ThemeSelection, &context, Uuid::new_v4()).unwrap();
        let err = validate_response(
            Some(&request),
            &InteractionResponse::select_theme(5),
            &context,
            1,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));
        assert!(err.escalates());
    }

    #[test]
    fn test_select_theme_and_apply() {
        let mut context = themed_context();
        let request = build_request(Stage::ThemeSelection, &context, Uuid::new_v4()).unwrap();
        let decision = validate_response(
            Some(&request),
            &InteractionResponse::select_theme(1),
            &context,
            1,
        )
        .unwrap();
        let outcome = apply_decision(&mut context, Stage::ThemeSelection, decision).unwrap();
        assert_eq!(outcome, Outcome::Approved);
        assert_eq!(context.theme.selected.as_ref().map(|t| t.title.as_str()), Some("Budget"));
    }

    #[test]
    fn test_declined_outline_means_regenerate() {
        let mut context = GenerationContext::default();
        context
            .commit(Stage::OutlineGeneration, Artifact::Outline(outline(2)))
            .unwrap();
        let request = build_request(Stage::OutlineApproval, &context, Uuid::new_v4()).unwrap();
        let decision = validate_response(
            Some(&request),
            &InteractionResponse::approve_outline(false),
            &context,
            1,
        )
        .unwrap();
        assert_eq!(decision, Decision::Regenerate);
        let outcome = apply_decision(&mut context, Stage::OutlineApproval, decision).unwrap();
        assert_eq!(outcome, Outcome::Regenerate);
        assert!(context.outline.generated.is_none());
    }

    #[test]
    fn test_approving_invalid_outline_is_validation_error() {
        let mut context = GenerationContext::default();
        context
            .commit(Stage::OutlineGeneration, Artifact::Outline(outline(0)))
            .unwrap();
        let request = build_request(Stage::OutlineApproval, &context, Uuid::new_v4()).unwrap();
        let err = validate_response(
            Some(&request),
            &InteractionResponse::approve_outline(true),
            &context,
            1,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Validation { stage: Stage::OutlineApproval, .. }));
    }

    #[test]
    fn test_edit_and_proceed_with_custom_theme() {
        let context = themed_context();
        let request = build_request(Stage::ThemeSelection, &context, Uuid::new_v4()).unwrap();
        let decision = validate_response(
            Some(&request),
            &InteractionResponse::edit_and_proceed(json!({
                "title": "Passive houses",
                "description": "Energy-efficient builds",
            })),
            &context,
            1,
        )
        .unwrap();
        assert!(matches!(decision, Decision::SelectTheme(ref t) if t.title == "Passive houses"));

        let err = validate_response(
            Some(&request),
            &InteractionResponse::edit_and_proceed(json!({ "headline": 3 })),
            &context,
            1,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));
    }

    #[test]
    fn test_artifact_checks() {
        assert!(check_personas(&[]).is_err());
        let persona = Persona {
            id: 1,
            name: "Aki".to_string(),
            description: String::new(),
        };
        assert!(check_personas(&[persona.clone(), persona.clone()]).is_err());
        assert!(check_personas(&[persona]).is_ok());
        assert!(check_plan(&ResearchPlan {
            topic: "t".to_string(),
            queries: vec![]
        })
        .is_err());
    }
}
