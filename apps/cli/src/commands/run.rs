//! Run command implementation.
//!
//! Sends one request through the supervisor and reports what happened.

use super::{parse_json, print_decision, print_json, start_runtime};
use anyhow::bail;
use colored::Colorize;
use conductor_orchestrator::{ApprovalLevel, Outcome, RoutingRequest, SupervisorResponse};
use std::path::Path;

/// Execute the run command.
pub async fn execute(
    config: Option<&Path>,
    text: &str,
    approval: ApprovalLevel,
    requested_by: Option<String>,
    data: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let data = parse_json(data, "data")?;
    let mut request = RoutingRequest::new(text).with_granted(approval).with_data(data);
    if let Some(requested_by) = requested_by {
        request = request.with_requested_by(requested_by);
    }

    let runtime = start_runtime(config).await?;
    let response = runtime.supervisor().handle(&request).await;
    runtime.shutdown().await;
    let response = response?;

    if json {
        print_json(&response)?;
    } else {
        print_response(&response);
    }

    if let Some(reason) = failure_reason(&response) {
        bail!("Request failed: {}", reason);
    }
    Ok(())
}

fn print_response(response: &SupervisorResponse) {
    print_decision(&response.decision);
    println!();
    match &response.outcome {
        Outcome::Agent { agent_id, result } => {
            println!("{} {}", "Agent:".bold(), agent_id);
            if let Some(data) = &result.data {
                println!("{}", serde_json::to_string_pretty(data).unwrap_or_default());
            }
            if let Some(error) = &result.error {
                println!("{} {}", "Error:".red().bold(), error);
            }
        }
        Outcome::Workflow { execution } => {
            super::workflow::print_execution(execution);
        }
        Outcome::PendingApproval => {
            println!("{}", "Nothing was executed.".dimmed());
        }
    }
}

fn failure_reason(response: &SupervisorResponse) -> Option<String> {
    match &response.outcome {
        Outcome::Agent { result, .. } => result.error.as_ref().map(ToString::to_string),
        Outcome::Workflow { execution } => execution.failure.as_ref().map(ToString::to_string),
        Outcome::PendingApproval => None,
    }
}
