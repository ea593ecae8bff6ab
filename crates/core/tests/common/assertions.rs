//! Custom assertion helpers for integration tests.

use cp_protocol::{Event, ProcessState, Stage, StepEvent};

/// Assert that a sequence of events contains a DecisionApplied at `stage`.
pub fn has_decision(events: &[Event], stage: Stage) -> bool {
    events
        .iter()
        .any(|e| matches!(e, Event::DecisionApplied { stage: s, .. } if *s == stage))
}

/// Reason recorded with the automated decision taken at `stage`.
pub fn decision_reason(events: &[Event], stage: Stage) -> Option<String> {
    events.iter().find_map(|e| match e {
        Event::DecisionApplied {
            stage: s,
            automated: true,
            reason,
            ..
        } if *s == stage => reason.clone(),
        _ => None,
    })
}

/// Number of times `stage` was entered according to the step history.
pub fn times_entered(state: &ProcessState, stage: Stage) -> usize {
    state
        .step_history
        .iter()
        .filter(|r| r.stage == stage && r.event == StepEvent::Entered)
        .count()
}

/// Assert that no awaiting-input stage was left without a decision.
///
/// Once an awaiting-input stage is entered, the next stage entry must be
/// preceded by a `Decided` record (or the run must end through a failure,
/// cancellation, pause or restore).
pub fn assert_no_skipped_checkpoints(state: &ProcessState, awaiting: &[Stage]) {
    let mut waiting: Option<Stage> = None;
    for record in &state.step_history {
        match record.event {
            StepEvent::Entered => {
                if let Some(stage) = waiting {
                    panic!(
                        "entered {} while still waiting at {stage}: {:#?}",
                        record.stage, state.step_history
                    );
                }
                if awaiting.contains(&record.stage) {
                    waiting = Some(record.stage);
                }
            }
            StepEvent::Decided | StepEvent::Failed | StepEvent::Cancelled => waiting = None,
            StepEvent::Restored => {
                waiting = awaiting.contains(&record.stage).then_some(record.stage);
            }
            _ => {}
        }
    }
}
