//! Conductor CLI - command-line interface for the Conductor agent orchestrator
//!
//! This CLI provides a `conductor` command for classifying and routing
//! requests, running them through the supervisor, inspecting the agent roster
//! and validating or running workflows.

mod commands;

use clap::{Parser, Subcommand};
use conductor_orchestrator::ApprovalLevel;
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use commands::{agents, classify, route, run, workflow};

/// Conductor CLI - multi-agent request orchestration
///
/// Classifies free-form requests, routes them to agents or workflows and runs
/// them under the configured retry, approval and escalation policies.
#[derive(Parser, Debug)]
#[command(name = "conductor", author, version, about = "Conductor - multi-agent request orchestration")]
struct Args {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "warn", global = true)]
    log_level: String,

    /// Configuration file (overrides CONDUCTOR_CONFIG and ./conductor.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Classify a request without routing it
    Classify {
        /// Request text
        text: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Route a request without executing it
    Route {
        /// Request text
        text: String,

        /// Approval level the requester holds
        #[arg(short, long, default_value = "low")]
        approval: ApprovalLevel,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Classify, route and execute a request
    Run {
        /// Request text
        text: String,

        /// Approval level the requester holds
        #[arg(short, long, default_value = "low")]
        approval: ApprovalLevel,

        /// Who is making the request
        #[arg(long)]
        requested_by: Option<String>,

        /// Extra structured input, as a JSON object
        #[arg(long)]
        data: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the agent roster
    Agents {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Workflow commands
    #[command(subcommand)]
    Workflow(WorkflowCommand),
}

/// Workflow subcommands.
#[derive(Subcommand, Debug)]
pub enum WorkflowCommand {
    /// Validate the workflows of a configuration file
    Validate {
        /// Configuration file (defaults to the active configuration)
        path: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a workflow directly
    Run {
        /// Workflow ID
        id: String,

        /// Workflow input, as JSON
        #[arg(short, long)]
        input: Option<String>,

        /// Approval level the caller holds
        #[arg(short, long, default_value = "low")]
        approval: ApprovalLevel,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = args.config.as_deref();
    match args.command {
        Command::Classify { text, json } => classify::execute(config, &text, json)?,
        Command::Route { text, approval, json } => {
            route::execute(config, &text, approval, json).await?;
        }
        Command::Run { text, approval, requested_by, data, json } => {
            run::execute(config, &text, approval, requested_by, data.as_deref(), json).await?;
        }
        Command::Agents { json } => agents::execute(config, json).await?,
        Command::Workflow(command) => workflow::execute(config, command).await?,
    }

    Ok(())
}
