//! content-pipeline command-line interface.
//!
//! Every invocation opens the project's store, recovers runs left behind by
//! an earlier invocation, executes one command and shuts the engine down
//! cleanly. Runs waiting for input stay in the store until `respond` is
//! called.

mod commands;
mod output;

use clap::{Parser, Subcommand, ValueEnum};
use cp_core::capability::ScriptedCapability;
use cp_core::config::loader::load_config;
use cp_core::engine::auto_decision::AutoStrategy;
use cp_core::logging::init_logging;
use cp_core::persistence::SledGateway;
use cp_core::telemetry::TracingSink;
use cp_core::ExecutionManager;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "content-pipeline")]
#[command(version, about = "Run and steer content-generation pipelines")]
pub struct Cli {
    /// Project root containing `.content-pipeline/`
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start a new run
    Start(StartArgs),
    /// Show the state of a run
    Status {
        process_id: Uuid,
        /// Include the step history
        #[arg(long)]
        history: bool,
    },
    /// List all runs
    List,
    /// Answer the outstanding request of a run
    Respond {
        process_id: Uuid,
        /// Response type, e.g. select_persona or approve_outline
        response_type: String,
        /// JSON payload, e.g. '{"selected_id": 1}'
        payload: Option<String>,
    },
    /// Pause a run
    Pause { process_id: Uuid },
    /// Resume a paused run, or restore it to one of its snapshots
    Resume {
        process_id: Uuid,
        #[arg(long)]
        snapshot: Option<Uuid>,
    },
    /// Cancel a run
    Cancel { process_id: Uuid },
    /// List the snapshots of a run
    Snapshots { process_id: Uuid },
    /// Restore a snapshot into a new run
    Restore { snapshot_id: Uuid },
    /// Delete a finished or waiting run
    Delete { process_id: Uuid },
}

#[derive(clap::Args)]
pub struct StartArgs {
    /// Run parameters file (YAML or JSON)
    #[arg(long)]
    params: Option<PathBuf>,

    /// Target keyword; repeat for several. Overrides the file's keywords.
    #[arg(short, long = "keyword")]
    keywords: Vec<String>,

    #[arg(long, default_value = "local")]
    owner: String,

    /// Decide every checkpoint automatically
    #[arg(long)]
    auto: bool,

    #[arg(long, value_enum)]
    persona_strategy: Option<StrategyArg>,

    #[arg(long, value_enum)]
    theme_strategy: Option<StrategyArg>,

    /// Keyword `best_match` scores against; defaults to the run's keywords
    #[arg(long = "target-keyword")]
    target_keywords: Vec<String>,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum StrategyArg {
    First,
    BestMatch,
}

impl From<StrategyArg> for AutoStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::First => AutoStrategy::First,
            StrategyArg::BestMatch => AutoStrategy::BestMatch,
        }
    }
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let config = load_config(&cli.root).await?;
    init_logging(&config.logging)?;

    let gateway = Arc::new(SledGateway::open(&config.storage.path)?);
    let auto_defaults = config.auto.clone();
    let manager = ExecutionManager::new(
        config,
        Arc::new(ScriptedCapability::new()),
        gateway.clone(),
        Arc::new(TracingSink),
    );

    let interrupted = manager.recover().await?;
    if !interrupted.is_empty() {
        info!(count = interrupted.len(), "marked interrupted runs as paused");
    }

    let result = commands::run(&manager, cli.command, &auto_defaults, cli.json).await;

    manager.shutdown().await?;
    gateway.flush().await?;
    result
}
