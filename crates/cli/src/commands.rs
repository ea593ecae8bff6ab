//! Command dispatch.

use crate::output;
use crate::{Command, StartArgs};
use color_eyre::eyre::{bail, eyre, Result, WrapErr};
use cp_core::config::loader::load_params;
use cp_core::engine::auto_decision::AutoModeSettings;
use cp_core::interaction::codec::decode_payload;
use cp_core::{ExecutionManager, StartRequest};
use cp_protocol::{GenerationParams, UserInputType};
use serde_json::Value;
use uuid::Uuid;

pub async fn run(
    manager: &ExecutionManager,
    command: Command,
    auto_defaults: &AutoModeSettings,
    json: bool,
) -> Result<()> {
    match command {
        Command::Start(args) => start(manager, args, auto_defaults, json).await,
        Command::Status {
            process_id,
            history,
        } => {
            let state = manager.get_state(process_id).await?;
            output::print_state(&state, json)?;
            if history && !json {
                output::print_history(&state);
            }
            Ok(())
        }
        Command::List => {
            let states = manager.list_processes().await?;
            output::print_list(&states, json)
        }
        Command::Respond {
            process_id,
            response_type,
            payload,
        } => respond(manager, process_id, &response_type, payload.as_deref(), json).await,
        Command::Pause { process_id } => {
            manager.pause(process_id).await?;
            let state = manager.wait_until_settled(process_id).await?;
            output::print_state(&state, json)
        }
        Command::Resume {
            process_id,
            snapshot,
        } => {
            manager.resume(process_id, snapshot).await?;
            settle_and_print(manager, process_id, json).await
        }
        Command::Cancel { process_id } => {
            manager.cancel(process_id).await?;
            let state = manager.get_state(process_id).await?;
            output::print_state(&state, json)
        }
        Command::Snapshots { process_id } => {
            let snapshots = manager.list_snapshots(process_id).await?;
            output::print_snapshots(&snapshots, json)
        }
        Command::Restore { snapshot_id } => {
            let process_id = manager.restore_snapshot(snapshot_id).await?;
            settle_and_print(manager, process_id, json).await
        }
        Command::Delete { process_id } => {
            manager.delete_process(process_id).await?;
            output::print_deleted(process_id, json)
        }
    }
}

async fn start(
    manager: &ExecutionManager,
    args: StartArgs,
    auto_defaults: &AutoModeSettings,
    json: bool,
) -> Result<()> {
    let mut params = match &args.params {
        Some(path) => load_params(path).await?,
        None => GenerationParams {
            persona_count: 3,
            theme_count: 3,
            ..Default::default()
        },
    };
    if !args.keywords.is_empty() {
        params.keywords = args.keywords;
    }
    if params.keywords.is_empty() {
        bail!("no keywords given; pass --keyword or a --params file");
    }

    let auto = args.auto.then(|| {
        let mut settings = auto_defaults.clone();
        if let Some(strategy) = args.persona_strategy {
            settings.persona_strategy = strategy.into();
        }
        if let Some(strategy) = args.theme_strategy {
            settings.theme_strategy = strategy.into();
        }
        if !args.target_keywords.is_empty() {
            settings.target_keywords = args.target_keywords;
        }
        settings
    });

    let process_id = manager
        .start(StartRequest {
            owner_id: args.owner,
            params,
            auto,
        })
        .await?;
    settle_and_print(manager, process_id, json).await
}

async fn respond(
    manager: &ExecutionManager,
    process_id: Uuid,
    response_type: &str,
    payload: Option<&str>,
    json: bool,
) -> Result<()> {
    let kind: UserInputType =
        serde_json::from_value(Value::String(response_type.replace('-', "_")))
            .map_err(|_| eyre!("unknown response type '{response_type}'"))?;
    let payload: Value = match payload {
        Some(raw) => serde_json::from_str(raw).wrap_err("payload is not valid JSON")?,
        None => Value::Object(Default::default()),
    };
    let response = decode_payload(kind, payload)?;

    manager.submit_response(process_id, response).await?;
    settle_and_print(manager, process_id, json).await
}

/// Wait until the run stops making progress on its own, then print it.
async fn settle_and_print(manager: &ExecutionManager, process_id: Uuid, json: bool) -> Result<()> {
    let state = manager.wait_until_settled(process_id).await?;
    output::print_state(&state, json)?;
    if !json {
        let process = manager.get_process(process_id).await?;
        if let Some(final_output) = &process.context.writing.final_output {
            output::print_final_output(final_output);
        }
    }
    Ok(())
}
