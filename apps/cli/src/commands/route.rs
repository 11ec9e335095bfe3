//! Route command implementation.

use super::{print_decision, print_json, start_runtime};
use conductor_orchestrator::{ApprovalLevel, RoutingRequest};
use std::path::Path;

/// Execute the route command.
pub async fn execute(
    config: Option<&Path>,
    text: &str,
    approval: ApprovalLevel,
    json: bool,
) -> anyhow::Result<()> {
    let runtime = start_runtime(config).await?;
    let request = RoutingRequest::new(text).with_granted(approval);
    let decision = runtime.supervisor().route(&request).await;
    runtime.shutdown().await;

    let decision = decision?;
    if json {
        print_json(&decision)
    } else {
        print_decision(&decision);
        Ok(())
    }
}
