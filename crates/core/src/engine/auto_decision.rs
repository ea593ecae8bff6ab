//! Automated decisions for unattended runs.
//!
//! [`decide`] is a pure function of the outstanding request, the context and
//! the run's settings. Its response is then validated and applied exactly like
//! a manual one.

use crate::context::outline::check_structure;
use crate::context::GenerationContext;
use crate::error::{EngineError, EngineResult};
use cp_protocol::{InteractionRequest, InteractionResponse, RequestData};
use serde::{Deserialize, Serialize};

/// How a candidate is picked at a selection stage.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AutoStrategy {
    /// The first candidate, regardless of content.
    #[default]
    First,
    /// The candidate whose text covers most target keywords.
    BestMatch,
}

/// Per-run auto-mode settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AutoModeSettings {
    #[serde(default)]
    pub persona_strategy: AutoStrategy,
    #[serde(default)]
    pub theme_strategy: AutoStrategy,
    /// Keywords `best_match` scores against. Empty means the run's keywords.
    #[serde(default)]
    pub target_keywords: Vec<String>,
    /// Minimum number of top-level outline sections required for approval.
    #[serde(default = "default_min_outline_sections")]
    pub min_outline_sections: usize,
}

fn default_min_outline_sections() -> usize {
    1
}

impl Default for AutoModeSettings {
    fn default() -> Self {
        Self {
            persona_strategy: AutoStrategy::First,
            theme_strategy: AutoStrategy::First,
            target_keywords: Vec::new(),
            min_outline_sections: default_min_outline_sections(),
        }
    }
}

/// A synthesized response and why it was chosen.
#[derive(Debug, Clone, PartialEq)]
pub struct AutoDecision {
    pub response: InteractionResponse,
    pub reason: String,
    /// Match score of the chosen candidate, for `best_match`.
    pub score: Option<f64>,
}

/// Fraction of `targets` contained in `text`, case-insensitively.
pub fn match_score(text: &str, targets: &[String]) -> f64 {
    let targets: Vec<String> = targets
        .iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    if targets.is_empty() {
        return 0.0;
    }
    let haystack = text.to_lowercase();
    let matched = targets.iter().filter(|t| haystack.contains(t.as_str())).count();
    matched as f64 / targets.len() as f64
}

/// Index and score of the best candidate; ties go to the lower index.
fn best_candidate(texts: &[String], targets: &[String]) -> Option<(usize, f64)> {
    texts
        .iter()
        .enumerate()
        .map(|(index, text)| (index, match_score(text, targets)))
        .fold(None, |best, (index, score)| match best {
            Some((_, best_score)) if best_score >= score => best,
            _ => Some((index, score)),
        })
}

fn pick(
    strategy: AutoStrategy,
    texts: &[String],
    targets: &[String],
    what: &str,
) -> Option<(usize, String, Option<f64>)> {
    if texts.is_empty() {
        return None;
    }
    match strategy {
        AutoStrategy::First => Some((0, format!("first: picked {what} 0"), None)),
        AutoStrategy::BestMatch => best_candidate(texts, targets).map(|(index, score)| {
            (
                index,
                format!(
                    "best_match: picked {what} {index} with match score {score:.2} against [{}]",
                    targets.join(", ")
                ),
                Some(score),
            )
        }),
    }
}

/// Synthesize a response for the outstanding request.
///
/// # Errors
///
/// Returns `Validation` when there is nothing to choose from, or when the
/// outline under review fails the structural validator. The run then moves to
/// `error` instead of approving.
pub fn decide(
    request: &InteractionRequest,
    context: &GenerationContext,
    settings: &AutoModeSettings,
) -> EngineResult<AutoDecision> {
    let targets: Vec<String> = if settings.target_keywords.is_empty() {
        context.params().keywords.clone()
    } else {
        settings.target_keywords.clone()
    };
    let nothing_to_choose = |what: &str| EngineError::Validation {
        stage: request.stage,
        message: format!("no {what} candidates to choose from"),
    };

    match &request.data {
        RequestData::PersonaChoices { personas } => {
            let texts: Vec<String> = personas
                .iter()
                .map(|p| format!("{} {}", p.name, p.description))
                .collect();
            let (index, reason, score) =
                pick(settings.persona_strategy, &texts, &targets, "persona")
                    .ok_or_else(|| nothing_to_choose("persona"))?;
            Ok(AutoDecision {
                response: InteractionResponse::select_persona(personas[index].id),
                reason,
                score,
            })
        }
        RequestData::ThemeChoices { themes } => {
            let texts: Vec<String> = themes
                .iter()
                .map(|t| format!("{} {} {}", t.title, t.description, t.keywords.join(" ")))
                .collect();
            let (index, reason, score) = pick(settings.theme_strategy, &texts, &targets, "theme")
                .ok_or_else(|| nothing_to_choose("theme"))?;
            Ok(AutoDecision {
                response: InteractionResponse::select_theme(index as u32),
                reason,
                score,
            })
        }
        RequestData::PlanReview { plan } => Ok(AutoDecision {
            response: InteractionResponse::approve_plan(true),
            reason: format!("research plan with {} queries approved", plan.queries.len()),
            score: None,
        }),
        RequestData::OutlineReview { outline, .. } => {
            check_structure(outline, settings.min_outline_sections).map_err(|message| {
                EngineError::Validation {
                    stage: request.stage,
                    message: format!("outline failed structural validation: {message}"),
                }
            })?;
            Ok(AutoDecision {
                response: InteractionResponse::approve_outline(true),
                reason: format!(
                    "outline with {} top-level sections passed structural validation",
                    outline.sections.len()
                ),
                score: None,
            })
        }
    }
}
