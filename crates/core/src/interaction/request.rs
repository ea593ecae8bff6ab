//! Interaction request construction.

use crate::context::outline::flatten;
use crate::context::GenerationContext;
use crate::error::{EngineError, EngineResult};
use chrono::Utc;
use cp_protocol::{InteractionRequest, RequestData, Stage, UserInputType};
use uuid::Uuid;

/// Primary input kind expected at an awaiting-input stage.
pub fn input_kind(stage: Stage) -> Option<UserInputType> {
    match stage {
        Stage::PersonaSelection => Some(UserInputType::SelectPersona),
        Stage::ThemeSelection => Some(UserInputType::SelectTheme),
        Stage::PlanApproval => Some(UserInputType::ApprovePlan),
        Stage::OutlineApproval => Some(UserInputType::ApproveOutline),
        _ => None,
    }
}

fn missing(stage: Stage, what: &str) -> EngineError {
    EngineError::Precondition {
        stage,
        message: format!("{what} is not set"),
    }
}

/// Build the request a run raises when it reaches `stage`.
///
/// # Errors
///
/// - `Precondition` if the artifact to review is missing from the context
/// - `Internal` if `stage` is not an awaiting-input stage
pub fn build_request(
    stage: Stage,
    context: &GenerationContext,
    process_id: Uuid,
) -> EngineResult<InteractionRequest> {
    let kind = input_kind(stage)
        .ok_or_else(|| EngineError::Internal(format!("{stage} does not wait for input")))?;

    let data = match stage {
        Stage::PersonaSelection => RequestData::PersonaChoices {
            personas: context
                .persona
                .candidates
                .clone()
                .ok_or_else(|| missing(stage, "persona candidates"))?,
        },
        Stage::ThemeSelection => RequestData::ThemeChoices {
            themes: context
                .theme
                .candidates
                .clone()
                .ok_or_else(|| missing(stage, "theme candidates"))?,
        },
        Stage::PlanApproval => RequestData::PlanReview {
            plan: context
                .research
                .plan
                .clone()
                .ok_or_else(|| missing(stage, "research plan"))?,
        },
        _ => {
            let outline = context
                .outline
                .generated
                .clone()
                .ok_or_else(|| missing(stage, "generated outline"))?;
            let writing_order = flatten(&outline);
            RequestData::OutlineReview {
                outline,
                writing_order,
            }
        }
    };

    Ok(InteractionRequest {
        request_id: Uuid::new_v4(),
        process_id,
        stage,
        kind,
        accepted: vec![kind, UserInputType::Regenerate, UserInputType::EditAndProceed],
        data,
        created_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Artifact;
    use cp_protocol::{GenerationParams, ResearchPlan, ResearchQuery};

    #[test]
    fn test_plan_request_accepts_primary_kind_first() {
        let mut context = GenerationContext::new(GenerationParams::default());
        context
            .commit(
                Stage::ResearchPlanning,
                Artifact::ResearchPlan(ResearchPlan {
                    topic: "homes".to_string(),
                    queries: vec![ResearchQuery {
                        query: "land prices".to_string(),
                        focus: String::new(),
                    }],
                }),
            )
            .unwrap();

        let process_id = Uuid::new_v4();
        let request = build_request(Stage::PlanApproval, &context, process_id).unwrap();

        assert_eq!(request.process_id, process_id);
        assert_eq!(request.kind, UserInputType::ApprovePlan);
        assert_eq!(request.accepted[0], UserInputType::ApprovePlan);
        assert!(request.accepts(UserInputType::Regenerate));
        assert!(!request.accepts(UserInputType::SelectTheme));
        assert!(matches!(request.data, RequestData::PlanReview { .. }));
    }

    #[test]
    fn test_missing_artifact_is_precondition() {
        let context = GenerationContext::default();
        let err = build_request(Stage::OutlineApproval, &context, Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, EngineError::Precondition { .. }));
    }

    #[test]
    fn test_autonomous_stage_has_no_request() {
        let context = GenerationContext::default();
        let err = build_request(Stage::Editing, &context, Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, EngineError::Internal(_)));
    }
}
