//! Building a runtime from a configuration file.

use conductor_abstraction::{NotificationPriority, RecordingNotifier};
use conductor_orchestrator::{
    AgentRole, ConductorConfig, OrchestrationError, Outcome, RoutingRequest, Runtime,
};
use std::io::Write;
use std::sync::Arc;

const WAREHOUSE_CONFIG: &str = r#"
workflows = []

[routing]
catch_all = "desk"

[[routing.categories]]
category = "inventory_query"
tag = "stock"

[escalation]
channel = "warehouse-ops"

[[agents]]
kind = "escalation"
id = "desk"
name = "Front desk"

[[agents]]
kind = "inventory"
id = "stock-7"
name = "Stock"
tags = ["stock"]
collection = "bins"

[[agents]]
kind = "echo"
id = "stock-helper"
name = "Helper"
role = "sub"
parent = "stock-7"

[seed.bins.SKU-5]
stock = 9
warehouse = "east"
"#;

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[tokio::test]
async fn test_runtime_from_file() {
    let file = write_config(WAREHOUSE_CONFIG);
    let config = ConductorConfig::load(file.path()).unwrap();
    let notifier = Arc::new(RecordingNotifier::new());
    let runtime = Runtime::from_config(config, notifier.clone()).await.unwrap();

    let helper = runtime.registry().find_by_id("stock-helper").await.unwrap();
    assert_eq!(helper.role, AgentRole::Sub);
    assert_eq!(helper.parent_id.as_deref(), Some("stock-7"));

    let response =
        runtime.supervisor().handle(&RoutingRequest::new("inventory for sku-5")).await.unwrap();
    match response.outcome {
        Outcome::Agent { agent_id, result } => {
            assert_eq!(agent_id, "stock-7");
            assert_eq!(result.data.unwrap()["warehouse"], "east");
        }
        other => panic!("expected agent outcome, got {:?}", other),
    }

    runtime.supervisor().handle(&RoutingRequest::new("urgent outage")).await.unwrap();
    let sent = notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].channel, "warehouse-ops");
    assert_eq!(sent[0].priority, NotificationPriority::High);

    assert_eq!(runtime.shutdown().await, 3);
}

#[test]
fn test_dangling_references_are_rejected() {
    let broken = WAREHOUSE_CONFIG.replace("catch_all = \"desk\"", "catch_all = \"nobody\"");
    let file = write_config(&broken);
    let err = ConductorConfig::load(file.path()).unwrap_err();
    assert!(matches!(err, OrchestrationError::Configuration(_)));
    assert!(err.to_string().contains("nobody"));
}
