//! Classification, routing and the supervisor on a default runtime.

use conductor_abstraction::RecordingNotifier;
use conductor_orchestrator::{
    ApprovalLevel, ConductorConfig, DecisionState, Outcome, RouteTarget, RoutingRequest, Runtime,
    routing::Resolution,
};
use std::sync::Arc;

async fn runtime() -> (Runtime, Arc<RecordingNotifier>) {
    let notifier = Arc::new(RecordingNotifier::new());
    let runtime = Runtime::from_config(ConductorConfig::default(), notifier.clone()).await.unwrap();
    (runtime, notifier)
}

#[tokio::test]
async fn test_inventory_question_returns_stock() {
    let (runtime, _) = runtime().await;
    let request = RoutingRequest::new("Check inventory for SKU-123").with_requested_by("ops@example.com");

    let response = runtime.supervisor().handle(&request).await.unwrap();
    assert_eq!(response.decision.intent.category, "inventory_query");
    assert_eq!(response.decision.resolution, Resolution::TagMatch);
    assert_eq!(response.decision.target, RouteTarget::Agent("inventory-1".into()));

    match response.outcome {
        Outcome::Agent { result, .. } => {
            let output = result.data.unwrap();
            assert_eq!(output["sku"], "SKU-123");
            assert_eq!(output["stock"], 42);
            assert_eq!(output["warehouse"], "north");
        }
        other => panic!("expected agent outcome, got {:?}", other),
    }
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_low_confidence_goes_to_catch_all() {
    let (runtime, notifier) = runtime().await;
    let response =
        runtime.supervisor().handle(&RoutingRequest::new("what's for lunch today?")).await.unwrap();

    assert!(response.decision.intent.is_unknown());
    assert_eq!(response.decision.resolution, Resolution::CatchAll);
    assert_eq!(response.decision.target, RouteTarget::Agent("escalation".into()));
    assert!(response.is_success());
    assert_eq!(notifier.sent().len(), 1);
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_unknown_sku_is_reported_not_raised() {
    let (runtime, _) = runtime().await;
    let response =
        runtime.supervisor().handle(&RoutingRequest::new("stock level of SKU-999")).await.unwrap();

    assert!(!response.is_success());
    match response.outcome {
        Outcome::Agent { result, .. } => {
            assert_eq!(result.error.unwrap().code, "validation_failure");
        }
        other => panic!("expected agent outcome, got {:?}", other),
    }
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_month_end_close_needs_approval() {
    let (runtime, _) = runtime().await;
    let request = RoutingRequest::new("start the month end close for 2024-02");

    let decision = runtime.supervisor().route(&request).await.unwrap();
    assert_eq!(decision.state, DecisionState::PendingApproval);
    assert_eq!(decision.target, RouteTarget::Workflow("month_end_close".into()));
    assert_eq!(decision.required_approval, ApprovalLevel::Medium);

    let approved = request.clone().with_granted(ApprovalLevel::Medium);
    let response = runtime.supervisor().handle(&approved).await.unwrap();
    assert!(response.is_success());
    runtime.shutdown().await;
}
