//! Observability sink.
//!
//! Fire-and-forget: implementations must not block and cannot fail the run.

use crate::capability::Usage;
use cp_protocol::{Event, Stage};
use std::sync::Mutex;

pub trait TelemetrySink: Send + Sync {
    /// Usage reported by one successful capability call.
    fn record_usage(&self, stage: Stage, task: &str, usage: &Usage);

    /// A server event, after its state change was persisted.
    fn record_event(&self, event: &Event);
}

/// Sink that writes everything through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn record_usage(&self, stage: Stage, task: &str, usage: &Usage) {
        tracing::info!(
            target: "content_pipeline::usage",
            %stage,
            task,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            cost_usd = usage.cost_usd,
            "capability usage"
        );
    }

    fn record_event(&self, event: &Event) {
        match event {
            Event::ProcessError {
                process_id,
                stage,
                error,
            } => tracing::warn!(%process_id, %stage, error, "process failed"),
            other => tracing::debug!(process_id = %other.process_id(), event = ?other, "step"),
        }
    }
}

/// Sink that keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    usage: Mutex<Vec<(Stage, String, Usage)>>,
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn usage(&self) -> Vec<(Stage, String, Usage)> {
        self.usage.lock().map(|u| u.clone()).unwrap_or_default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Total reported cost across all calls.
    pub fn total_cost_usd(&self) -> f64 {
        self.usage().iter().map(|(_, _, usage)| usage.cost_usd).sum()
    }
}

impl TelemetrySink for MemorySink {
    fn record_usage(&self, stage: Stage, task: &str, usage: &Usage) {
        if let Ok(mut recorded) = self.usage.lock() {
            recorded.push((stage, task.to_string(), *usage));
        }
    }

    fn record_event(&self, event: &Event) {
        if let Ok(mut recorded) = self.events.lock() {
            recorded.push(event.clone());
        }
    }
}
