//! Agents command implementation.
//!
//! Spawns the configured roster and lists it.

use super::{print_json, start_runtime};
use colored::Colorize;
use conductor_orchestrator::AgentRole;
use serde_json::json;
use std::path::Path;

/// Execute the agents command.
pub async fn execute(config: Option<&Path>, json_output: bool) -> anyhow::Result<()> {
    let runtime = start_runtime(config).await?;
    let mut entries = runtime.registry().list().await;
    entries.sort_by(|a, b| a.id().cmp(b.id()));

    let rows: Vec<_> = entries
        .iter()
        .map(|entry| {
            let config = entry.handle.config();
            json!({
                "id": entry.id(),
                "name": config.name,
                "role": entry.role,
                "parent": entry.parent_id,
                "tags": entry.tags,
                "state": entry.handle.state().to_string(),
                "enabled": config.enabled,
                "approval_level": config.approval_level,
                "max_retries": config.max_retries,
                "timeout_ms": config.timeout_ms,
            })
        })
        .collect();
    runtime.shutdown().await;

    if json_output {
        return print_json(&rows);
    }

    if entries.is_empty() {
        println!("{}", "No agents configured.".yellow());
        return Ok(());
    }

    println!("{}", format!("Agents ({})", entries.len()).bold());
    for entry in &entries {
        let config = entry.handle.config();
        let role = match (&entry.role, &entry.parent_id) {
            (AgentRole::Sub, Some(parent)) => format!("sub of {}", parent),
            _ => entry.role.to_string(),
        };
        let tags: Vec<&str> = entry.tags.iter().map(String::as_str).collect();
        let id = if config.enabled { entry.id().green() } else { entry.id().dimmed() };
        println!("  {:<20} {:<24} {}", id, role, config.name);
        if !tags.is_empty() {
            println!("  {:<20} {}", "", format!("tags: {}", tags.join(", ")).dimmed());
        }
    }
    Ok(())
}
