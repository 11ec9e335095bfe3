//! Integration tests for the `conductor` command.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// A command running in an empty directory, so only built-in defaults apply.
fn conductor(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("conductor").unwrap();
    cmd.current_dir(dir.path())
        .env_remove("CONDUCTOR_CONFIG")
        .env_remove("RUST_LOG")
        .env("NO_COLOR", "1");
    cmd
}

#[test]
fn test_classify_json() {
    let dir = TempDir::new().unwrap();
    conductor(&dir)
        .args(["classify", "check inventory for SKU-123", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"category\": \"inventory_query\""))
        .stdout(predicate::str::contains("SKU-123"));
}

#[test]
fn test_classify_unknown() {
    let dir = TempDir::new().unwrap();
    conductor(&dir)
        .args(["classify", "good morning"])
        .assert()
        .success()
        .stdout(predicate::str::contains("unknown"));
}

#[test]
fn test_run_inventory_request() {
    let dir = TempDir::new().unwrap();
    conductor(&dir)
        .args(["run", "Check inventory for SKU-123", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("inventory-1"))
        .stdout(predicate::str::contains("\"stock\": 42"));
}

#[test]
fn test_run_unknown_sku_fails() {
    let dir = TempDir::new().unwrap();
    conductor(&dir)
        .args(["run", "stock for SKU-999"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown SKU"));
}

#[test]
fn test_route_pending_approval() {
    let dir = TempDir::new().unwrap();
    conductor(&dir)
        .args(["route", "run the month end close for 2024-05"])
        .assert()
        .success()
        .stdout(predicate::str::contains("workflow:month_end_close"))
        .stdout(predicate::str::contains("Pending approval"));
}

#[test]
fn test_agents_json() {
    let dir = TempDir::new().unwrap();
    conductor(&dir)
        .args(["agents", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"id\": \"ledger-1\""))
        .stdout(predicate::str::contains("\"parent\": \"close-coordinator\""));
}

#[test]
fn test_workflow_run_with_approval() {
    let dir = TempDir::new().unwrap();
    conductor(&dir)
        .args(["workflow", "run", "month_end_close", "--approval", "medium", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"status\": \"succeeded\""));
}

#[test]
fn test_workflow_run_unknown() {
    let dir = TempDir::new().unwrap();
    conductor(&dir)
        .args(["workflow", "run", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Workflow not found"));
}

#[test]
fn test_workflow_validate_rejects_cycle() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cyclic.toml");
    fs::write(
        &path,
        r#"
[[workflows]]
id = "loop"
name = "Loop"

[[workflows.steps]]
id = "a"
target = { tag = "ledger" }
depends_on = ["b"]

[[workflows.steps]]
id = "b"
target = { tag = "ledger" }
depends_on = ["a"]
"#,
    )
    .unwrap();

    conductor(&dir)
        .args(["workflow", "validate"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("cycle"));
}

#[test]
fn test_local_config_is_discovered() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("conductor.toml"),
        r#"
workflows = []

[routing]
catch_all = "desk"

[[agents]]
kind = "escalation"
id = "desk"
name = "Desk"
"#,
    )
    .unwrap();

    conductor(&dir)
        .args(["workflow", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("conductor.toml"))
        .stdout(predicate::str::contains("No workflows defined"));
}

#[test]
fn test_invalid_approval_level() {
    let dir = TempDir::new().unwrap();
    conductor(&dir)
        .args(["route", "hello", "--approval", "critical"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid approval level"));
}

#[test]
fn test_example_config_validates() {
    let dir = TempDir::new().unwrap();
    let example = concat!(env!("CARGO_MANIFEST_DIR"), "/conductor.example.toml");
    conductor(&dir)
        .args(["--config", example, "workflow", "validate", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"id\": \"month_end_close\""))
        .stdout(predicate::str::contains("report"));
}
