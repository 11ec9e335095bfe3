//! Command implementations for the Conductor CLI.

pub mod agents;
pub mod classify;
pub mod route;
pub mod run;
pub mod workflow;

use anyhow::Context;
use colored::Colorize;
use conductor_abstraction::LogNotifier;
use conductor_orchestrator::{ConductorConfig, ConfigSource, RoutingDecision, Runtime};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Loads the configuration named on the command line, or discovers one.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<(ConductorConfig, ConfigSource)> {
    match path {
        Some(path) => {
            let config = ConductorConfig::load(path)
                .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
            Ok((config, ConfigSource::File(path.to_path_buf())))
        }
        None => ConductorConfig::discover().context("Failed to load configuration"),
    }
}

/// Builds a runtime whose escalations go to the log.
pub async fn start_runtime(path: Option<&Path>) -> anyhow::Result<Runtime> {
    let (config, source) = load_config(path)?;
    debug!(source = %source, "Starting runtime");
    Runtime::from_config(config, Arc::new(LogNotifier))
        .await
        .context("Failed to start the agent runtime")
}

/// Parses an optional JSON argument, defaulting to an empty object.
pub fn parse_json(arg: Option<&str>, name: &str) -> anyhow::Result<serde_json::Value> {
    match arg {
        Some(raw) => serde_json::from_str(raw).with_context(|| format!("--{} is not valid JSON", name)),
        None => Ok(serde_json::json!({})),
    }
}

/// Prints a value as pretty JSON.
pub fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Prints a routing decision in human-readable form.
pub fn print_decision(decision: &RoutingDecision) {
    println!("{}", "Routing decision".bold());
    println!(
        "  {:<10} {} ({:.2})",
        "intent:".dimmed(),
        decision.intent.category.cyan(),
        decision.intent.confidence
    );
    for (name, value) in &decision.intent.params {
        println!("  {:<10} {} = {}", "param:".dimmed(), name, value);
    }
    println!("  {:<10} {}", "target:".dimmed(), decision.target.to_string().green());
    println!("  {:<10} {:?}", "via:".dimmed(), decision.resolution);
    println!(
        "  {:<10} requires {}, granted {}",
        "approval:".dimmed(),
        decision.required_approval,
        decision.granted_approval
    );
    println!("  {:<10} {}", "why:".dimmed(), decision.rationale);
    if decision.is_pending() {
        println!();
        println!(
            "{}",
            format!("Pending approval: needs {} or higher.", decision.required_approval).yellow()
        );
    }
}
