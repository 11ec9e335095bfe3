//! Built-in agent implementations.
//!
//! These are the agents a configuration roster can name by `kind`. Each one
//! only implements the [`Agent`](crate::agent::Agent) capability; lifecycle,
//! retries and escalation are handled by the handle that wraps it.

pub mod echo;
pub mod escalation;
pub mod inventory;

pub use echo::EchoAgent;
pub use escalation::EscalationAgent;
pub use inventory::{DEFAULT_INVENTORY_COLLECTION, InventoryAgent};
