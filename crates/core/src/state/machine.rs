//! Pipeline state machine.
//!
//! A stateless transition table over [`Stage`]. Stage kinds (autonomous,
//! awaiting-input, terminal), the main path and progress percentages are all
//! derived from [`TRANSITIONS`], so the table is the only place the pipeline
//! graph is written down.

use cp_protocol::Stage;
use std::fmt;

/// Result of running a stage or applying a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// An autonomous stage produced a validated artifact.
    Succeeded,
    /// A decision was accepted at an awaiting-input stage.
    Approved,
    /// A decision asked for the reviewed artifact to be generated again.
    Regenerate,
    /// The stage failed with no local recovery.
    Failed,
    /// The run was cancelled.
    Cancelled,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Outcome::Succeeded => "succeeded",
            Outcome::Approved => "approved",
            Outcome::Regenerate => "regenerate",
            Outcome::Failed => "failed",
            Outcome::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Classification of a stage, derived from the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Autonomous,
    AwaitingInput,
    Terminal,
}

/// Explicit edges. `Failed` and `Cancelled` edges are implied for every stage
/// that has an outgoing edge here.
const TRANSITIONS: &[(Stage, Outcome, Stage)] = &[
    (Stage::Start, Outcome::Succeeded, Stage::KeywordAnalysis),
    (Stage::KeywordAnalysis, Outcome::Succeeded, Stage::PersonaGeneration),
    (Stage::PersonaGeneration, Outcome::Succeeded, Stage::PersonaSelection),
    (Stage::PersonaSelection, Outcome::Approved, Stage::ThemeGeneration),
    (Stage::PersonaSelection, Outcome::Regenerate, Stage::PersonaGeneration),
    (Stage::ThemeGeneration, Outcome::Succeeded, Stage::ThemeSelection),
    (Stage::ThemeSelection, Outcome::Approved, Stage::ResearchPlanning),
    (Stage::ThemeSelection, Outcome::Regenerate, Stage::ThemeGeneration),
    (Stage::ResearchPlanning, Outcome::Succeeded, Stage::PlanApproval),
    (Stage::PlanApproval, Outcome::Approved, Stage::ResearchExecution),
    (Stage::PlanApproval, Outcome::Regenerate, Stage::ResearchPlanning),
    (Stage::ResearchExecution, Outcome::Succeeded, Stage::ResearchSynthesis),
    (Stage::ResearchSynthesis, Outcome::Succeeded, Stage::OutlineGeneration),
    (Stage::OutlineGeneration, Outcome::Succeeded, Stage::OutlineApproval),
    (Stage::OutlineApproval, Outcome::Approved, Stage::SectionWriting),
    (Stage::OutlineApproval, Outcome::Regenerate, Stage::OutlineGeneration),
    (Stage::SectionWriting, Outcome::Succeeded, Stage::Editing),
    (Stage::Editing, Outcome::Succeeded, Stage::Completed),
];

/// Stateless view over the transition table.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineStateMachine;

impl PipelineStateMachine {
    pub fn new() -> Self {
        Self
    }

    fn explicit(&self, stage: Stage, outcome: Outcome) -> Option<Stage> {
        TRANSITIONS
            .iter()
            .find(|(from, on, _)| *from == stage && *on == outcome)
            .map(|(_, _, to)| *to)
    }

    fn has_outgoing(&self, stage: Stage) -> bool {
        TRANSITIONS.iter().any(|(from, _, _)| *from == stage)
    }

    /// Next stage for `(stage, outcome)`, or `None` when the table defines no
    /// such transition. Callers treat `None` as an internal invariant violation.
    pub fn get_next(&self, stage: Stage, outcome: Outcome) -> Option<Stage> {
        match outcome {
            Outcome::Failed if self.has_outgoing(stage) => Some(Stage::Error),
            Outcome::Cancelled if self.has_outgoing(stage) => Some(Stage::Cancelled),
            Outcome::Failed | Outcome::Cancelled => None,
            _ => self.explicit(stage, outcome),
        }
    }

    pub fn kind(&self, stage: Stage) -> StageKind {
        if self.explicit(stage, Outcome::Approved).is_some() {
            StageKind::AwaitingInput
        } else if self.explicit(stage, Outcome::Succeeded).is_some() {
            StageKind::Autonomous
        } else {
            StageKind::Terminal
        }
    }

    pub fn is_awaiting_input(&self, stage: Stage) -> bool {
        self.kind(stage) == StageKind::AwaitingInput
    }

    pub fn is_terminal(&self, stage: Stage) -> bool {
        self.kind(stage) == StageKind::Terminal
    }

    pub fn is_autonomous(&self, stage: Stage) -> bool {
        self.kind(stage) == StageKind::Autonomous
    }

    /// Generation stage an awaiting-input stage loops back to on `Regenerate`.
    pub fn regeneration_target(&self, stage: Stage) -> Option<Stage> {
        self.explicit(stage, Outcome::Regenerate)
    }

    /// The success path from `start` to `completed`.
    pub fn main_path(&self) -> Vec<Stage> {
        let mut path = vec![Stage::Start];
        let mut current = Stage::Start;
        while let Some(next) = self
            .explicit(current, Outcome::Succeeded)
            .or_else(|| self.explicit(current, Outcome::Approved))
        {
            path.push(next);
            current = next;
        }
        path
    }

    /// Every awaiting-input stage, in pipeline order.
    pub fn awaiting_stages(&self) -> Vec<Stage> {
        self.main_path()
            .into_iter()
            .filter(|stage| self.is_awaiting_input(*stage))
            .collect()
    }

    /// Position of `stage` along the main path as a percentage.
    ///
    /// `None` for `error` and `cancelled`, which keep the last progress value.
    pub fn progress_percentage(&self, stage: Stage) -> Option<u8> {
        let path = self.main_path();
        let last = path.len().saturating_sub(1).max(1);
        path.iter()
            .position(|s| *s == stage)
            .map(|index| ((index * 100) / last) as u8)
    }
}
