//! Stage executor.
//!
//! Runs one autonomous stage against a read-only context: dependency check,
//! capability calls with retry and exponential backoff, decoding and
//! structural checks. The executor never writes to the context; the engine
//! commits the returned artifact.

use crate::capability::input::build_inputs;
use crate::capability::{Capability, CapabilityRequest};
use crate::config::RetryConfig;
use crate::context::{Artifact, GenerationContext};
use crate::engine::validation::{check_personas, check_plan, check_themes};
use crate::error::EngineError;
use crate::telemetry::TelemetrySink;
use cp_protocol::{
    CompiledOutput, GenerationParams, KeywordAnalysis, Outline, Persona, ResearchPlan,
    ResearchReport, ResearchResult, SectionContent, Stage, Theme,
};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Why a stage could not produce its artifact.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StageFailure {
    #[error("Precondition violated at {stage}: {message}")]
    Precondition { stage: Stage, message: String },

    #[error("Validation failed at {stage}: {message}")]
    Validation { stage: Stage, message: String },

    #[error("Capability call failed at {stage} after {attempts} attempt(s): {message}")]
    Capability {
        stage: Stage,
        attempts: u32,
        message: String,
    },
}

impl From<StageFailure> for EngineError {
    fn from(failure: StageFailure) -> Self {
        match failure {
            StageFailure::Precondition { stage, message } => {
                EngineError::Precondition { stage, message }
            }
            StageFailure::Validation { stage, message } => EngineError::Validation { stage, message },
            StageFailure::Capability {
                stage,
                attempts,
                message,
            } => EngineError::Capability {
                stage,
                attempts,
                message,
            },
        }
    }
}

fn from_engine(stage: Stage, err: EngineError) -> StageFailure {
    match err {
        EngineError::Precondition { stage, message } => StageFailure::Precondition { stage, message },
        EngineError::Validation { stage, message } => StageFailure::Validation { stage, message },
        other => StageFailure::Precondition {
            stage,
            message: other.to_string(),
        },
    }
}

fn invalid(stage: Stage, message: impl Into<String>) -> StageFailure {
    StageFailure::Validation {
        stage,
        message: message.into(),
    }
}

fn decode<T: DeserializeOwned>(stage: Stage, output: serde_json::Value) -> Result<T, StageFailure> {
    serde_json::from_value(output)
        .map_err(|e| invalid(stage, format!("output does not match the expected schema: {e}")))
}

fn single(stage: Stage, mut outputs: Vec<serde_json::Value>) -> Result<serde_json::Value, StageFailure> {
    if outputs.len() != 1 {
        return Err(invalid(
            stage,
            format!("expected one output, got {}", outputs.len()),
        ));
    }
    Ok(outputs.remove(0))
}

/// Validate and normalize run parameters: trimmed, de-duplicated, non-empty
/// keywords and at least one candidate per selection stage.
pub fn normalize_params(params: &GenerationParams) -> Result<GenerationParams, StageFailure> {
    let mut keywords: Vec<String> = Vec::new();
    for keyword in &params.keywords {
        let keyword = keyword.trim();
        if !keyword.is_empty() && !keywords.iter().any(|k| k == keyword) {
            keywords.push(keyword.to_string());
        }
    }
    if keywords.is_empty() {
        return Err(invalid(Stage::Start, "at least one non-empty keyword is required"));
    }
    if params.persona_count == 0 || params.theme_count == 0 {
        return Err(invalid(Stage::Start, "candidate counts must be at least 1"));
    }
    Ok(GenerationParams {
        keywords,
        target_audience: params
            .target_audience
            .as_ref()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty()),
        ..params.clone()
    })
}

/// Executes autonomous stages through the capability provider.
pub struct StageExecutor {
    capability: Arc<dyn Capability>,
    retry: RetryConfig,
    telemetry: Arc<dyn TelemetrySink>,
}

impl StageExecutor {
    pub fn new(
        capability: Arc<dyn Capability>,
        retry: RetryConfig,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            capability,
            retry,
            telemetry,
        }
    }

    /// Produce the artifact of `stage` from `context`.
    ///
    /// # Errors
    ///
    /// - `Precondition` if a declared dependency is unset (never retried)
    /// - `Capability` if a call keeps failing transiently past the retry
    ///   budget, or fails permanently
    /// - `Validation` if an output does not decode into the stage's artifact
    ///   or fails its structural check (never retried)
    pub async fn execute(
        &self,
        stage: Stage,
        context: &GenerationContext,
    ) -> Result<Artifact, StageFailure> {
        context.require(stage).map_err(|e| from_engine(stage, e))?;

        if stage == Stage::Start {
            return normalize_params(&context.input.requested).map(Artifact::Parameters);
        }

        let requests = build_inputs(stage, context).map_err(|e| from_engine(stage, e))?;
        if requests.is_empty() && stage != Stage::SectionWriting {
            return Err(StageFailure::Precondition {
                stage,
                message: "stage has no capability work".to_string(),
            });
        }

        let mut outputs = Vec::with_capacity(requests.len());
        for request in &requests {
            outputs.push(self.call_with_retry(request).await?);
        }
        debug!(%stage, calls = requests.len(), "capability calls finished");

        self.decode_artifact(stage, outputs, context)
    }

    async fn call_with_retry(
        &self,
        request: &CapabilityRequest,
    ) -> Result<serde_json::Value, StageFailure> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.capability.invoke(request).await {
                Ok(response) => {
                    self.telemetry
                        .record_usage(request.stage, &request.task, &response.usage);
                    return Ok(response.output);
                }
                Err(err) if err.is_transient() && attempt <= self.retry.max_retries => {
                    let backoff = self.retry.backoff_for_attempt(attempt - 1);
                    warn!(
                        stage = %request.stage,
                        task = %request.task,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "transient capability failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => {
                    return Err(StageFailure::Capability {
                        stage: request.stage,
                        attempts: attempt,
                        message: err.to_string(),
                    });
                }
            }
        }
    }

    fn decode_artifact(
        &self,
        stage: Stage,
        outputs: Vec<serde_json::Value>,
        context: &GenerationContext,
    ) -> Result<Artifact, StageFailure> {
        match stage {
            Stage::KeywordAnalysis => {
                let analysis: KeywordAnalysis = decode(stage, single(stage, outputs)?)?;
                if analysis.primary_keywords.is_empty() {
                    return Err(invalid(stage, "no primary keywords"));
                }
                Ok(Artifact::KeywordAnalysis(analysis))
            }
            Stage::PersonaGeneration => {
                let personas: Vec<Persona> = decode(stage, single(stage, outputs)?)?;
                check_personas(&personas).map_err(|m| invalid(stage, m))?;
                Ok(Artifact::Personas(personas))
            }
            Stage::ThemeGeneration => {
                let themes: Vec<Theme> = decode(stage, single(stage, outputs)?)?;
                check_themes(&themes).map_err(|m| invalid(stage, m))?;
                Ok(Artifact::Themes(themes))
            }
            Stage::ResearchPlanning => {
                let plan: ResearchPlan = decode(stage, single(stage, outputs)?)?;
                check_plan(&plan).map_err(|m| invalid(stage, m))?;
                Ok(Artifact::ResearchPlan(plan))
            }
            Stage::ResearchExecution => {
                let expected = context
                    .research
                    .approved_plan
                    .as_ref()
                    .map(|plan| plan.queries.len())
                    .unwrap_or_default();
                if outputs.len() != expected {
                    return Err(invalid(
                        stage,
                        format!("expected {expected} research results, got {}", outputs.len()),
                    ));
                }
                let results = outputs
                    .into_iter()
                    .map(|output| decode::<ResearchResult>(stage, output))
                    .collect::<Result<Vec<_>, _>>()?;
                if results.iter().any(|r| r.summary.trim().is_empty()) {
                    return Err(invalid(stage, "a research result has an empty summary"));
                }
                Ok(Artifact::ResearchResults(results))
            }
            Stage::ResearchSynthesis => {
                let report: ResearchReport = decode(stage, single(stage, outputs)?)?;
                if report.summary.trim().is_empty() {
                    return Err(invalid(stage, "research report has an empty summary"));
                }
                Ok(Artifact::ResearchReport(report))
            }
            // Structure is checked when the outline is approved.
            Stage::OutlineGeneration => {
                let outline: Outline = decode(stage, single(stage, outputs)?)?;
                Ok(Artifact::Outline(outline))
            }
            Stage::SectionWriting => {
                let order = context.writing_order().unwrap_or_default();
                if outputs.len() != order.len() {
                    return Err(invalid(
                        stage,
                        format!("expected {} sections, got {}", order.len(), outputs.len()),
                    ));
                }
                let sections = outputs
                    .into_iter()
                    .map(|output| decode::<SectionContent>(stage, output))
                    .collect::<Result<Vec<_>, _>>()?;
                if let Some(empty) = sections.iter().find(|s| s.content.trim().is_empty()) {
                    return Err(invalid(
                        stage,
                        format!("section '{}' has no content", empty.heading),
                    ));
                }
                Ok(Artifact::Sections(sections))
            }
            Stage::Editing => {
                let output: CompiledOutput = decode(stage, single(stage, outputs)?)?;
                if output.body.trim().is_empty() {
                    return Err(invalid(stage, "compiled output is empty"));
                }
                Ok(Artifact::FinalOutput(output))
            }
            other => Err(StageFailure::Precondition {
                stage: other,
                message: "stage is not autonomous".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::ScriptedCapability;
    use crate::telemetry::MemorySink;
    use serde_json::json;

    fn executor(capability: ScriptedCapability, retry: RetryConfig) -> (StageExecutor, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        (
            StageExecutor::new(Arc::new(capability), retry, sink.clone()),
            sink,
        )
    }

    fn started_context() -> GenerationContext {
        let mut context = GenerationContext::new(GenerationParams {
            keywords: vec![" 札幌 ".to_string(), "注文住宅".to_string(), "札幌".to_string()],
            ..Default::default()
        });
        let params = normalize_params(&context.input.requested).unwrap();
        context
            .commit(Stage::Start, Artifact::Parameters(params))
            .unwrap();
        context
    }

    #[test]
    fn test_normalize_params() {
        let context = started_context();
        assert_eq!(context.params().keywords, vec!["札幌", "注文住宅"]);

        let empty = GenerationParams {
            keywords: vec!["  ".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            normalize_params(&empty),
            Err(StageFailure::Validation { stage: Stage::Start, .. })
        ));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let capability = ScriptedCapability::new().with_transient_failures(Stage::KeywordAnalysis, 2);
        let (executor, sink) = executor(capability.clone(), RetryConfig { max_retries: 3, ..RetryConfig::none() });

        let artifact = executor
            .execute(Stage::KeywordAnalysis, &started_context())
            .await
            .unwrap();

        assert!(matches!(artifact, Artifact::KeywordAnalysis(_)));
        assert_eq!(capability.call_count(Stage::KeywordAnalysis), 3);
        assert_eq!(sink.usage().len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_yield_capability_error() {
        let capability = ScriptedCapability::new().with_transient_failures(Stage::KeywordAnalysis, 10);
        let (executor, _) = executor(capability.clone(), RetryConfig { max_retries: 2, ..RetryConfig::none() });

        let err = executor
            .execute(Stage::KeywordAnalysis, &started_context())
            .await
            .unwrap_err();

        assert!(matches!(err, StageFailure::Capability { attempts: 3, .. }));
        assert_eq!(capability.call_count(Stage::KeywordAnalysis), 3);
    }

    #[tokio::test]
    async fn test_schema_mismatch_is_not_retried() {
        let capability = ScriptedCapability::new()
            .with_output(Stage::KeywordAnalysis, json!({ "unexpected": true }));
        let (executor, _) = executor(capability.clone(), RetryConfig { max_retries: 3, ..RetryConfig::none() });

        let err = executor
            .execute(Stage::KeywordAnalysis, &started_context())
            .await
            .unwrap_err();

        assert!(matches!(err, StageFailure::Validation { .. }));
        assert_eq!(capability.call_count(Stage::KeywordAnalysis), 1);
    }

    #[tokio::test]
    async fn test_missing_dependency_makes_no_call() {
        let capability = ScriptedCapability::new();
        let (executor, _) = executor(capability.clone(), RetryConfig::none());

        let err = executor
            .execute(Stage::OutlineGeneration, &started_context())
            .await
            .unwrap_err();

        assert!(matches!(err, StageFailure::Precondition { .. }));
        assert!(capability.calls().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_persona_ids_rejected() {
        let capability = ScriptedCapability::new().with_output(
            Stage::PersonaGeneration,
            json!([
                { "id": 1, "name": "A", "description": "" },
                { "id": 1, "name": "B", "description": "" }
            ]),
        );
        let (executor, _) = executor(capability, RetryConfig::none());
        let mut context = started_context();
        let analysis = executor
            .execute(Stage::KeywordAnalysis, &context)
            .await
            .unwrap();
        context.commit(Stage::KeywordAnalysis, analysis).unwrap();

        let err = executor
            .execute(Stage::PersonaGeneration, &context)
            .await
            .unwrap_err();
        assert!(matches!(err, StageFailure::Validation { .. }));
    }
}
