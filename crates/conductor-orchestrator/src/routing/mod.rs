//! Intent classification and request routing.
//!
//! Free-form requests are classified into an [`Intent`] and then resolved by
//! the [`AgentRouter`] to an agent or a workflow.

pub mod classifier;
pub mod router;

pub use classifier::{
    ClassifierConfig, DEFAULT_CONFIDENCE_FLOOR, Intent, IntentClassifier, IntentRule,
    UNKNOWN_CATEGORY,
};
pub use router::{
    AgentRouter, CategoryRoute, DecisionState, Resolution, RouteTarget, RoutingConfig,
    RoutingDecision, RoutingRequest,
};
