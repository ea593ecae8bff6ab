//! Terminal rendering.

use color_eyre::eyre::Result;
use colored::{ColoredString, Colorize};
use cp_protocol::{
    CompiledOutput, InteractionRequest, ProcessState, ProcessStatus, RequestData, SnapshotMeta,
};
use serde::Serialize;
use uuid::Uuid;

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn status_label(status: ProcessStatus) -> ColoredString {
    let label = status.as_str();
    match status {
        ProcessStatus::Running => label.blue(),
        ProcessStatus::AwaitingInput => label.yellow().bold(),
        ProcessStatus::Paused => label.yellow(),
        ProcessStatus::Completed => label.green().bold(),
        ProcessStatus::Error => label.red().bold(),
        ProcessStatus::Cancelled => label.dimmed(),
    }
}

pub fn print_state(state: &ProcessState, json: bool) -> Result<()> {
    if json {
        return print_json(state);
    }
    println!("{} {}", "Process".bold(), state.process_id);
    println!(
        "  {} ({}%)  {}",
        state.current_step_label,
        state.progress_percentage,
        status_label(state.status)
    );
    if let Some(reason) = state.pause_reason {
        println!("  paused: {reason:?}");
    }
    if let Some(error) = &state.error {
        println!("  {} at {}: {}", "error".red(), error.stage, error.message);
    }
    if let Some(request) = &state.pending_request {
        print_request(request);
    }
    Ok(())
}

fn print_request(request: &InteractionRequest) {
    println!();
    println!("{} {}", "Waiting for".bold(), request.kind.to_string().cyan());
    match &request.data {
        RequestData::PersonaChoices { personas } => {
            for persona in personas {
                println!("  [{}] {}: {}", persona.id, persona.name.bold(), persona.description);
            }
        }
        RequestData::ThemeChoices { themes } => {
            for (index, theme) in themes.iter().enumerate() {
                println!("  ({index}) {}: {}", theme.title.bold(), theme.description);
            }
        }
        RequestData::PlanReview { plan } => {
            println!("  topic: {}", plan.topic.bold());
            for query in &plan.queries {
                println!("  - {}", query.query);
            }
        }
        RequestData::OutlineReview {
            outline,
            writing_order,
        } => {
            println!("  {}", outline.title.bold());
            for section in writing_order {
                let depth = section.level.saturating_sub(outline.top_level_heading) as usize;
                println!("  {}{}", "  ".repeat(depth), section.heading);
            }
        }
    }
    let accepted: Vec<&str> = request.accepted.iter().map(|t| t.as_str()).collect();
    println!("  accepts: {}", accepted.join(", ").dimmed());
}

pub fn print_history(state: &ProcessState) {
    println!();
    for record in &state.step_history {
        let detail = record.detail.as_deref().unwrap_or_default();
        println!(
            "  {} {:<20} {:?} {}",
            record.recorded_at.format("%H:%M:%S").to_string().dimmed(),
            record.stage.as_str(),
            record.event,
            detail
        );
    }
}

pub fn print_list(states: &[ProcessState], json: bool) -> Result<()> {
    if json {
        return print_json(states);
    }
    if states.is_empty() {
        println!("No runs.");
        return Ok(());
    }
    for state in states {
        println!(
            "{}  {:<16} {:<20} {:>3}%  {}",
            state.process_id,
            status_label(state.status),
            state.current_step.as_str(),
            state.progress_percentage,
            state.owner_id
        );
    }
    Ok(())
}

pub fn print_snapshots(snapshots: &[SnapshotMeta], json: bool) -> Result<()> {
    if json {
        return print_json(snapshots);
    }
    if snapshots.is_empty() {
        println!("No snapshots.");
        return Ok(());
    }
    for snapshot in snapshots {
        println!(
            "{}  {:<18} branch {}  {}",
            snapshot.snapshot_id,
            snapshot.stage.as_str(),
            snapshot.branch_id,
            snapshot.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

pub fn print_deleted(process_id: Uuid, json: bool) -> Result<()> {
    if json {
        return print_json(&serde_json::json!({ "deleted": process_id }));
    }
    println!("Deleted {process_id}");
    Ok(())
}

pub fn print_final_output(output: &CompiledOutput) {
    println!();
    println!("{}", output.title.bold().underline());
    println!();
    println!("{}", output.body);
}
