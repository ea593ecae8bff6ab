//! Stage artifact models.
//!
//! Every autonomous stage produces one of these structures. They are stored in
//! the generation context, rendered inside interaction requests, and accepted
//! back as `edited_content` when a user edits an artifact before proceeding.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Input parameters supplied when a run is started.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default, TS)]
pub struct GenerationParams {
    /// Target search keywords, e.g. `["札幌", "注文住宅"]`.
    pub keywords: Vec<String>,

    /// Free-form description of the intended readership.
    #[serde(default)]
    pub target_audience: Option<String>,

    /// Desired article length in characters.
    #[serde(default)]
    pub target_length: Option<u32>,

    /// Number of persona candidates to generate.
    #[serde(default = "default_candidate_count")]
    pub persona_count: u32,

    /// Number of theme candidates to generate.
    #[serde(default = "default_candidate_count")]
    pub theme_count: u32,
}

fn default_candidate_count() -> u32 {
    3
}

/// Output of the keyword analysis stage.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct KeywordAnalysis {
    pub primary_keywords: Vec<String>,
    #[serde(default)]
    pub related_keywords: Vec<String>,
    #[serde(default)]
    pub search_intent: String,
}

/// A reader persona candidate.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct Persona {
    /// Identifier referenced by `select_persona.selected_id`.
    pub id: u32,
    pub name: String,
    pub description: String,
}

/// An article theme candidate.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct Theme {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// One query of a research plan.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct ResearchQuery {
    pub query: String,
    #[serde(default)]
    pub focus: String,
}

/// The research plan awaiting approval.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct ResearchPlan {
    pub topic: String,
    pub queries: Vec<ResearchQuery>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct SourceRef {
    pub title: String,
    pub url: String,
}

/// Result of executing one research query.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct ResearchResult {
    pub query: String,
    pub summary: String,
    #[serde(default)]
    pub sources: Vec<SourceRef>,
}

/// Synthesized research across all query results.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct ResearchReport {
    pub summary: String,
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default)]
    pub sources: Vec<SourceRef>,
}

/// A node of the outline tree.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct OutlineSection {
    pub heading: String,
    /// HTML heading level (`2` for `<h2>`).
    pub level: u8,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub subsections: Vec<OutlineSection>,
}

/// Article outline. The tree form is canonical; the writing order is derived.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct Outline {
    pub title: String,
    /// Heading level used by every top-level section.
    pub top_level_heading: u8,
    pub sections: Vec<OutlineSection>,
}

/// One entry of the flattened writing order of an outline.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct FlatSection {
    /// Index path from the outline root, e.g. `[1, 0]` for the first child of
    /// the second top-level section.
    pub path: Vec<usize>,
    pub heading: String,
    pub level: u8,
    pub description: String,
}

/// Written body of one outline section.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct SectionContent {
    pub heading: String,
    pub level: u8,
    pub content: String,
}

/// Final compiled article.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct CompiledOutput {
    pub title: String,
    pub body: String,
}
