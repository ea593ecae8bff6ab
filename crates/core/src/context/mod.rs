//! Generation context.
//!
//! The context is the data aggregate owned by one generation process. Each
//! stage writes exactly one artifact into it; the artifacts are grouped into
//! stage-scoped sub-structs so the dependency checks read naturally.
//!
//! Writes happen through two doors only: [`GenerationContext::commit`] for
//! validated stage artifacts, and the `apply_*` methods for decisions taken at
//! awaiting-input stages. Both refuse to overwrite a field that is already set.
//! [`GenerationContext::clear_for_regeneration`] is the single exception and
//! is used when a decision asks for an artifact to be generated again.

pub mod outline;

use crate::error::{EngineError, EngineResult};
use cp_protocol::{
    CompiledOutput, FlatSection, GenerationParams, KeywordAnalysis, Outline, Persona,
    ResearchPlan, ResearchReport, ResearchResult, SectionContent, Stage, Theme,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Run input as requested and as accepted by the `start` stage.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct InputParams {
    pub requested: GenerationParams,
    #[serde(default)]
    pub accepted: Option<GenerationParams>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct PersonaInputs {
    #[serde(default)]
    pub candidates: Option<Vec<Persona>>,
    #[serde(default)]
    pub selected: Option<Persona>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ThemeInputs {
    #[serde(default)]
    pub candidates: Option<Vec<Theme>>,
    #[serde(default)]
    pub selected: Option<Theme>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ResearchInputs {
    /// Plan as generated.
    #[serde(default)]
    pub plan: Option<ResearchPlan>,
    /// Plan as approved, possibly edited.
    #[serde(default)]
    pub approved_plan: Option<ResearchPlan>,
    /// One result per approved query, in plan order.
    #[serde(default)]
    pub results: Option<Vec<ResearchResult>>,
    #[serde(default)]
    pub report: Option<ResearchReport>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct OutlineInputs {
    #[serde(default)]
    pub generated: Option<Outline>,
    #[serde(default)]
    pub approved: Option<Outline>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct WritingOutputs {
    /// One entry per flattened outline section, in writing order.
    #[serde(default)]
    pub sections: Option<Vec<SectionContent>>,
    #[serde(default)]
    pub final_output: Option<CompiledOutput>,
}

/// Every artifact accumulated by one generation process.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct GenerationContext {
    pub input: InputParams,
    #[serde(default)]
    pub keywords: Option<KeywordAnalysis>,
    #[serde(default)]
    pub persona: PersonaInputs,
    #[serde(default)]
    pub theme: ThemeInputs,
    #[serde(default)]
    pub research: ResearchInputs,
    #[serde(default)]
    pub outline: OutlineInputs,
    #[serde(default)]
    pub writing: WritingOutputs,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Addressable context fields, used for dependency checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextField {
    AcceptedParams,
    KeywordAnalysis,
    PersonaCandidates,
    SelectedPersona,
    ThemeCandidates,
    SelectedTheme,
    ResearchPlan,
    ApprovedPlan,
    ResearchResults,
    ResearchReport,
    GeneratedOutline,
    ApprovedOutline,
    Sections,
    FinalOutput,
}

impl fmt::Display for ContextField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContextField::AcceptedParams => "accepted parameters",
            ContextField::KeywordAnalysis => "keyword analysis",
            ContextField::PersonaCandidates => "persona candidates",
            ContextField::SelectedPersona => "selected persona",
            ContextField::ThemeCandidates => "theme candidates",
            ContextField::SelectedTheme => "selected theme",
            ContextField::ResearchPlan => "research plan",
            ContextField::ApprovedPlan => "approved research plan",
            ContextField::ResearchResults => "research results",
            ContextField::ResearchReport => "research report",
            ContextField::GeneratedOutline => "generated outline",
            ContextField::ApprovedOutline => "approved outline",
            ContextField::Sections => "section contents",
            ContextField::FinalOutput => "final output",
        };
        f.write_str(name)
    }
}

/// Validated output of one autonomous stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Artifact {
    Parameters(GenerationParams),
    KeywordAnalysis(KeywordAnalysis),
    Personas(Vec<Persona>),
    Themes(Vec<Theme>),
    ResearchPlan(ResearchPlan),
    ResearchResults(Vec<ResearchResult>),
    ResearchReport(ResearchReport),
    Outline(Outline),
    Sections(Vec<SectionContent>),
    FinalOutput(CompiledOutput),
}

impl Artifact {
    /// Context field this artifact is written to.
    pub fn field(&self) -> ContextField {
        match self {
            Artifact::Parameters(_) => ContextField::AcceptedParams,
            Artifact::KeywordAnalysis(_) => ContextField::KeywordAnalysis,
            Artifact::Personas(_) => ContextField::PersonaCandidates,
            Artifact::Themes(_) => ContextField::ThemeCandidates,
            Artifact::ResearchPlan(_) => ContextField::ResearchPlan,
            Artifact::ResearchResults(_) => ContextField::ResearchResults,
            Artifact::ResearchReport(_) => ContextField::ResearchReport,
            Artifact::Outline(_) => ContextField::GeneratedOutline,
            Artifact::Sections(_) => ContextField::Sections,
            Artifact::FinalOutput(_) => ContextField::FinalOutput,
        }
    }
}

/// Fields a stage reads. Calling the stage with any of them unset is a
/// precondition violation.
pub fn dependencies(stage: Stage) -> &'static [ContextField] {
    use ContextField::*;
    match stage {
        Stage::Start => &[],
        Stage::KeywordAnalysis => &[AcceptedParams],
        Stage::PersonaGeneration => &[AcceptedParams, KeywordAnalysis],
        Stage::PersonaSelection => &[PersonaCandidates],
        Stage::ThemeGeneration => &[KeywordAnalysis, SelectedPersona],
        Stage::ThemeSelection => &[ThemeCandidates],
        Stage::ResearchPlanning => &[SelectedPersona, SelectedTheme],
        Stage::PlanApproval => &[ResearchPlan],
        Stage::ResearchExecution => &[ApprovedPlan],
        Stage::ResearchSynthesis => &[SelectedTheme, ResearchResults],
        Stage::OutlineGeneration => &[SelectedPersona, SelectedTheme, ResearchReport],
        Stage::OutlineApproval => &[GeneratedOutline],
        Stage::SectionWriting => &[SelectedPersona, ApprovedOutline, ResearchReport],
        Stage::Editing => &[ApprovedOutline, Sections],
        Stage::Completed | Stage::Error | Stage::Cancelled => &[],
    }
}

impl GenerationContext {
    pub fn new(params: GenerationParams) -> Self {
        Self {
            input: InputParams {
                requested: params,
                accepted: None,
            },
            ..Default::default()
        }
    }

    pub fn has(&self, field: ContextField) -> bool {
        match field {
            ContextField::AcceptedParams => self.input.accepted.is_some(),
            ContextField::KeywordAnalysis => self.keywords.is_some(),
            ContextField::PersonaCandidates => self.persona.candidates.is_some(),
            ContextField::SelectedPersona => self.persona.selected.is_some(),
            ContextField::ThemeCandidates => self.theme.candidates.is_some(),
            ContextField::SelectedTheme => self.theme.selected.is_some(),
            ContextField::ResearchPlan => self.research.plan.is_some(),
            ContextField::ApprovedPlan => self.research.approved_plan.is_some(),
            ContextField::ResearchResults => self.research.results.is_some(),
            ContextField::ResearchReport => self.research.report.is_some(),
            ContextField::GeneratedOutline => self.outline.generated.is_some(),
            ContextField::ApprovedOutline => self.outline.approved.is_some(),
            ContextField::Sections => self.writing.sections.is_some(),
            ContextField::FinalOutput => self.writing.final_output.is_some(),
        }
    }

    /// Fails with a precondition error naming the first unset dependency.
    pub fn require(&self, stage: Stage) -> EngineResult<()> {
        match dependencies(stage).iter().find(|field| !self.has(**field)) {
            Some(missing) => Err(EngineError::Precondition {
                stage,
                message: format!("{missing} is not set"),
            }),
            None => Ok(()),
        }
    }

    /// Parameters accepted by `start`, falling back to the requested ones.
    pub fn params(&self) -> &GenerationParams {
        self.input.accepted.as_ref().unwrap_or(&self.input.requested)
    }

    /// Writing order of the approved outline.
    pub fn writing_order(&self) -> Option<Vec<FlatSection>> {
        self.outline.approved.as_ref().map(outline::flatten)
    }

    /// Write a validated stage artifact into its field.
    pub fn commit(&mut self, stage: Stage, artifact: Artifact) -> EngineResult<()> {
        let field = artifact.field();
        if self.has(field) {
            return Err(EngineError::Precondition {
                stage,
                message: format!("{field} is already written"),
            });
        }
        match artifact {
            Artifact::Parameters(params) => self.input.accepted = Some(params),
            Artifact::KeywordAnalysis(analysis) => self.keywords = Some(analysis),
            Artifact::Personas(personas) => self.persona.candidates = Some(personas),
            Artifact::Themes(themes) => self.theme.candidates = Some(themes),
            Artifact::ResearchPlan(plan) => self.research.plan = Some(plan),
            Artifact::ResearchResults(results) => self.research.results = Some(results),
            Artifact::ResearchReport(report) => self.research.report = Some(report),
            Artifact::Outline(outline) => self.outline.generated = Some(outline),
            Artifact::Sections(sections) => self.writing.sections = Some(sections),
            Artifact::FinalOutput(output) => self.writing.final_output = Some(output),
        }
        Ok(())
    }

    fn decide<T>(slot: &mut Option<T>, value: T, stage: Stage, field: ContextField) -> EngineResult<()> {
        if slot.is_some() {
            return Err(EngineError::Precondition {
                stage,
                message: format!("{field} is already decided"),
            });
        }
        *slot = Some(value);
        Ok(())
    }

    pub fn apply_persona(&mut self, persona: Persona) -> EngineResult<()> {
        Self::decide(
            &mut self.persona.selected,
            persona,
            Stage::PersonaSelection,
            ContextField::SelectedPersona,
        )
    }

    pub fn apply_theme(&mut self, theme: Theme) -> EngineResult<()> {
        Self::decide(
            &mut self.theme.selected,
            theme,
            Stage::ThemeSelection,
            ContextField::SelectedTheme,
        )
    }

    pub fn apply_plan(&mut self, plan: ResearchPlan) -> EngineResult<()> {
        Self::decide(
            &mut self.research.approved_plan,
            plan,
            Stage::PlanApproval,
            ContextField::ApprovedPlan,
        )
    }

    pub fn apply_outline(&mut self, outline: Outline) -> EngineResult<()> {
        Self::decide(
            &mut self.outline.approved,
            outline,
            Stage::OutlineApproval,
            ContextField::ApprovedOutline,
        )
    }

    /// Drop the artifact reviewed at `awaiting_stage` so its generation stage
    /// can run again. Decisions taken at that stage are never set at this
    /// point, so nothing downstream is affected.
    pub fn clear_for_regeneration(&mut self, awaiting_stage: Stage) {
        match awaiting_stage {
            Stage::PersonaSelection => self.persona = PersonaInputs::default(),
            Stage::ThemeSelection => self.theme = ThemeInputs::default(),
            Stage::PlanApproval => {
                self.research.plan = None;
                self.research.approved_plan = None;
            }
            Stage::OutlineApproval => self.outline = OutlineInputs::default(),
            _ => {}
        }
    }

    pub fn record_error(&mut self, stage: Stage, message: &str) {
        self.last_error = Some(format!("{stage}: {message}"));
    }
}
