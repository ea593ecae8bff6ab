//! Pipeline stage identifiers.
//!
//! A stage is one node in the content-generation graph. Whether a stage runs
//! unattended, waits for a decision, or ends the run is not stored here: the
//! transition table in `cp-core` is the single source of truth for that.

use serde::{Deserialize, Serialize};
use std::fmt;
use ts_rs::TS;

/// One node of the content-generation pipeline.
///
/// Serialized in `snake_case`, e.g. `"persona_selection"`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, TS)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Input parameters are validated and normalized.
    Start,
    KeywordAnalysis,
    PersonaGeneration,
    /// Waits for the user to pick one of the generated personas.
    PersonaSelection,
    ThemeGeneration,
    /// Waits for the user to pick one of the generated themes.
    ThemeSelection,
    ResearchPlanning,
    /// Waits for the research plan to be approved.
    PlanApproval,
    ResearchExecution,
    ResearchSynthesis,
    OutlineGeneration,
    /// Waits for the outline to be approved.
    OutlineApproval,
    SectionWriting,
    Editing,
    Completed,
    Error,
    Cancelled,
}

impl Stage {
    /// Every stage, in pipeline order followed by the terminal stages.
    pub const ALL: [Stage; 17] = [
        Stage::Start,
        Stage::KeywordAnalysis,
        Stage::PersonaGeneration,
        Stage::PersonaSelection,
        Stage::ThemeGeneration,
        Stage::ThemeSelection,
        Stage::ResearchPlanning,
        Stage::PlanApproval,
        Stage::ResearchExecution,
        Stage::ResearchSynthesis,
        Stage::OutlineGeneration,
        Stage::OutlineApproval,
        Stage::SectionWriting,
        Stage::Editing,
        Stage::Completed,
        Stage::Error,
        Stage::Cancelled,
    ];

    /// Wire name of the stage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Start => "start",
            Stage::KeywordAnalysis => "keyword_analysis",
            Stage::PersonaGeneration => "persona_generation",
            Stage::PersonaSelection => "persona_selection",
            Stage::ThemeGeneration => "theme_generation",
            Stage::ThemeSelection => "theme_selection",
            Stage::ResearchPlanning => "research_planning",
            Stage::PlanApproval => "plan_approval",
            Stage::ResearchExecution => "research_execution",
            Stage::ResearchSynthesis => "research_synthesis",
            Stage::OutlineGeneration => "outline_generation",
            Stage::OutlineApproval => "outline_approval",
            Stage::SectionWriting => "section_writing",
            Stage::Editing => "editing",
            Stage::Completed => "completed",
            Stage::Error => "error",
            Stage::Cancelled => "cancelled",
        }
    }

    /// Human-readable label shown next to the current step.
    pub fn label(&self) -> &'static str {
        match self {
            Stage::Start => "Starting",
            Stage::KeywordAnalysis => "Analyzing keywords",
            Stage::PersonaGeneration => "Generating personas",
            Stage::PersonaSelection => "Waiting for persona selection",
            Stage::ThemeGeneration => "Generating themes",
            Stage::ThemeSelection => "Waiting for theme selection",
            Stage::ResearchPlanning => "Planning research",
            Stage::PlanApproval => "Waiting for research plan approval",
            Stage::ResearchExecution => "Running research",
            Stage::ResearchSynthesis => "Synthesizing research",
            Stage::OutlineGeneration => "Generating outline",
            Stage::OutlineApproval => "Waiting for outline approval",
            Stage::SectionWriting => "Writing sections",
            Stage::Editing => "Editing",
            Stage::Completed => "Completed",
            Stage::Error => "Error",
            Stage::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_as_str_matches_serde_name() {
        for stage in Stage::ALL {
            let json = serde_json::to_value(stage).unwrap();
            assert_eq!(json, stage.as_str());
        }
    }
}
