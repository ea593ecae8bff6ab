//! Capability input builders.
//!
//! Pure functions from a context snapshot to the capability requests of one
//! stage. Research execution issues one request per approved query and
//! section writing one request per section of the writing order; every other
//! autonomous stage issues exactly one.

use crate::capability::CapabilityRequest;
use crate::context::GenerationContext;
use crate::error::{EngineError, EngineResult};
use cp_protocol::Stage;
use serde_json::json;

fn need<'a, T>(value: &'a Option<T>, stage: Stage, what: &str) -> EngineResult<&'a T> {
    value.as_ref().ok_or_else(|| EngineError::Precondition {
        stage,
        message: format!("{what} is not set"),
    })
}

fn request(stage: Stage, task: &str, input: serde_json::Value) -> CapabilityRequest {
    CapabilityRequest {
        stage,
        task: task.to_string(),
        input,
    }
}

/// Build the capability requests for `stage`.
///
/// Stages without a capability call (`start`, awaiting-input and terminal
/// stages) yield an empty list.
pub fn build_inputs(stage: Stage, context: &GenerationContext) -> EngineResult<Vec<CapabilityRequest>> {
    context.require(stage)?;
    let params = context.params();

    let requests = match stage {
        Stage::KeywordAnalysis => vec![request(
            stage,
            "keyword_analysis",
            json!({
                "keywords": params.keywords,
                "target_audience": params.target_audience,
            }),
        )],
        Stage::PersonaGeneration => vec![request(
            stage,
            "persona_generation",
            json!({
                "keyword_analysis": need(&context.keywords, stage, "keyword analysis")?,
                "target_audience": params.target_audience,
                "count": params.persona_count,
            }),
        )],
        Stage::ThemeGeneration => vec![request(
            stage,
            "theme_generation",
            json!({
                "keyword_analysis": need(&context.keywords, stage, "keyword analysis")?,
                "persona": need(&context.persona.selected, stage, "selected persona")?,
                "count": params.theme_count,
            }),
        )],
        Stage::ResearchPlanning => vec![request(
            stage,
            "research_planning",
            json!({
                "persona": need(&context.persona.selected, stage, "selected persona")?,
                "theme": need(&context.theme.selected, stage, "selected theme")?,
            }),
        )],
        Stage::ResearchExecution => {
            let plan = need(&context.research.approved_plan, stage, "approved plan")?;
            plan.queries
                .iter()
                .enumerate()
                .map(|(index, query)| {
                    request(
                        stage,
                        "research_query",
                        json!({
                            "topic": plan.topic,
                            "index": index,
                            "query": query.query,
                            "focus": query.focus,
                        }),
                    )
                })
                .collect()
        }
        Stage::ResearchSynthesis => vec![request(
            stage,
            "research_synthesis",
            json!({
                "theme": need(&context.theme.selected, stage, "selected theme")?,
                "results": need(&context.research.results, stage, "research results")?,
            }),
        )],
        Stage::OutlineGeneration => vec![request(
            stage,
            "outline_generation",
            json!({
                "persona": need(&context.persona.selected, stage, "selected persona")?,
                "theme": need(&context.theme.selected, stage, "selected theme")?,
                "report": need(&context.research.report, stage, "research report")?,
                "target_length": params.target_length,
            }),
        )],
        Stage::SectionWriting => {
            let outline = need(&context.outline.approved, stage, "approved outline")?;
            let persona = need(&context.persona.selected, stage, "selected persona")?;
            let report = need(&context.research.report, stage, "research report")?;
            context
                .writing_order()
                .unwrap_or_default()
                .into_iter()
                .map(|section| {
                    request(
                        stage,
                        "section_writing",
                        json!({
                            "title": outline.title,
                            "section": section,
                            "persona": persona,
                            "report_summary": report.summary,
                            "key_points": report.key_points,
                        }),
                    )
                })
                .collect()
        }
        Stage::Editing => {
            let outline = need(&context.outline.approved, stage, "approved outline")?;
            vec![request(
                stage,
                "editing",
                json!({
                    "title": outline.title,
                    "sections": need(&context.writing.sections, stage, "section contents")?,
                    "target_length": params.target_length,
                }),
            )]
        }
        _ => Vec::new(),
    };
    Ok(requests)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Artifact;
    use cp_protocol::{
        GenerationParams, Outline, OutlineSection, Persona, ResearchPlan, ResearchQuery,
        ResearchReport, Theme,
    };

    fn context_with_plan(queries: usize) -> GenerationContext {
        let mut context = GenerationContext::new(GenerationParams {
            keywords: vec!["sapporo".to_string()],
            ..Default::default()
        });
        let plan = ResearchPlan {
            topic: "Housing".to_string(),
            queries: (0..queries)
                .map(|i| ResearchQuery {
                    query: format!("query {i}"),
                    focus: String::new(),
                })
                .collect(),
        };
        context.apply_plan(plan).unwrap();
        context
    }

    #[test]
    fn test_research_execution_issues_one_request_per_query() {
        let context = context_with_plan(3);
        let requests = build_inputs(Stage::ResearchExecution, &context).unwrap();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[2].input["query"], "query 2");
        assert_eq!(requests[2].input["index"], 2);
        assert!(requests.iter().all(|r| r.task == "research_query"));
    }

    #[test]
    fn test_missing_dependency_is_precondition() {
        let context = GenerationContext::default();
        let err = build_inputs(Stage::ThemeGeneration, &context).unwrap_err();
        assert!(matches!(err, EngineError::Precondition { stage: Stage::ThemeGeneration, .. }));
    }

    #[test]
    fn test_section_writing_follows_writing_order() {
        let mut context = context_with_plan(1);
        context
            .commit(
                Stage::ResearchSynthesis,
                Artifact::ResearchReport(ResearchReport {
                    summary: "summary".to_string(),
                    key_points: vec![],
                    sources: vec![],
                }),
            )
            .unwrap();
        context
            .apply_persona(Persona {
                id: 0,
                name: "Aki".to_string(),
                description: String::new(),
            })
            .unwrap();
        context
            .apply_theme(Theme {
                title: "Winter".to_string(),
                description: String::new(),
                keywords: vec![],
            })
            .unwrap();
        context
            .apply_outline(Outline {
                title: "Guide".to_string(),
                top_level_heading: 2,
                sections: vec![
                    OutlineSection {
                        heading: "A".to_string(),
                        level: 2,
                        description: String::new(),
                        subsections: vec![OutlineSection {
                            heading: "A.1".to_string(),
                            level: 3,
                            description: String::new(),
                            subsections: vec![],
                        }],
                    },
                    OutlineSection {
                        heading: "B".to_string(),
                        level: 2,
                        description: String::new(),
                        subsections: vec![],
                    },
                ],
            })
            .unwrap();

        let requests = build_inputs(Stage::SectionWriting, &context).unwrap();
        let headings: Vec<_> = requests
            .iter()
            .map(|r| r.input["section"]["heading"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(headings, vec!["A", "A.1", "B"]);
    }

    #[test]
    fn test_start_and_awaiting_stages_have_no_requests() {
        let context = GenerationContext::default();
        assert!(build_inputs(Stage::Start, &context).unwrap().is_empty());
    }
}
