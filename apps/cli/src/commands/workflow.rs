//! Workflow command implementation.

use super::{load_config, parse_json, print_json, start_runtime};
use crate::WorkflowCommand;
use anyhow::{Context, bail};
use colored::Colorize;
use conductor_orchestrator::{
    ApprovalLevel, ConductorConfig, ExecutionStatus, StepTarget, TaskStatus, WorkflowExecution,
};
use serde_json::json;
use std::path::Path;

/// Execute a workflow command.
pub async fn execute(config: Option<&Path>, command: WorkflowCommand) -> anyhow::Result<()> {
    match command {
        WorkflowCommand::Validate { path, json } => validate(path.as_deref().or(config), json),
        WorkflowCommand::Run { id, input, approval, json } => {
            run(config, &id, input.as_deref(), approval, json).await
        }
    }
}

/// Validate the configuration and print every workflow's execution order.
fn validate(path: Option<&Path>, json_output: bool) -> anyhow::Result<()> {
    let (config, source) = load_config(path)?;
    let workflows = describe(&config)?;

    if json_output {
        return print_json(&json!({ "source": source.to_string(), "workflows": workflows }));
    }

    println!("{} {}", "Configuration OK:".green().bold(), source);
    if config.workflows.is_empty() {
        println!("{}", "No workflows defined.".yellow());
    }
    for workflow in &config.workflows {
        let order = workflow.execution_order()?;
        println!();
        println!(
            "{} {} (approval {})",
            workflow.id.cyan().bold(),
            workflow.name,
            workflow.approval_level
        );
        for (index, step_id) in order.iter().enumerate() {
            let Some(step) = workflow.step(step_id) else { continue };
            let target = match &step.target {
                StepTarget::Agent(id) => format!("agent {}", id),
                StepTarget::Tag(tag) => format!("tag {}", tag),
            };
            let after = if step.depends_on.is_empty() {
                String::new()
            } else {
                format!(" after {}", step.depends_on.join(", "))
            };
            println!("  {}. {} -> {}{}", index + 1, step.id, target, after.dimmed());
        }
    }
    Ok(())
}

fn describe(config: &ConductorConfig) -> anyhow::Result<Vec<serde_json::Value>> {
    config
        .workflows
        .iter()
        .map(|workflow| {
            let order = workflow
                .execution_order()
                .with_context(|| format!("Workflow '{}' is invalid", workflow.id))?;
            Ok(json!({
                "id": workflow.id,
                "name": workflow.name,
                "approval_level": workflow.approval_level,
                "execution_order": order,
            }))
        })
        .collect()
}

/// Run a workflow directly, bypassing classification.
async fn run(
    config: Option<&Path>,
    id: &str,
    input: Option<&str>,
    approval: ApprovalLevel,
    json_output: bool,
) -> anyhow::Result<()> {
    let input = parse_json(input, "input")?;
    let runtime = start_runtime(config).await?;
    let execution = runtime.workflows().run(id, input, approval).await;
    runtime.shutdown().await;
    let execution = execution?;

    if json_output {
        print_json(&execution)?;
    } else {
        print_execution(&execution);
    }

    if let Some(failure) = &execution.failure {
        bail!("Workflow '{}' failed: {}", id, failure);
    }
    Ok(())
}

/// Prints a workflow execution in human-readable form.
pub fn print_execution(execution: &WorkflowExecution) {
    let status = match execution.status {
        ExecutionStatus::Succeeded => execution.status.to_string().green(),
        ExecutionStatus::Failed => execution.status.to_string().red(),
        _ => execution.status.to_string().yellow(),
    };
    println!("{} {} [{}]", "Workflow:".bold(), execution.workflow_id, status);
    println!("  {:<10} {}", "execution:".dimmed(), execution.execution_id);

    if let Some(pending) = &execution.pending_approval {
        println!(
            "{}",
            format!("  Pending approval: needs {}, caller holds {}.", pending.required, pending.granted)
                .yellow()
        );
        return;
    }

    for step in &execution.steps {
        let marker = match step.status {
            TaskStatus::Succeeded => "ok".green(),
            TaskStatus::Failed => "failed".red(),
            TaskStatus::InProgress => "running".yellow(),
        };
        let agent = step.agent_id.as_deref().unwrap_or("-");
        println!(
            "  {:<16} {:<8} agent {} ({} attempt{}, {:?})",
            step.step_id,
            marker,
            agent,
            step.attempts,
            if step.attempts == 1 { "" } else { "s" },
            step.duration
        );
    }
    if let Some(failure) = &execution.failure {
        println!("  {} {}", "error:".red(), failure);
    }
    if let Some(elapsed) = execution.elapsed() {
        println!("  {:<10} {:?}", "elapsed:".dimmed(), elapsed);
    }
}
