//! Stock lookups against the storage collaborator.

use crate::agent::{Agent, AgentConfig, AgentContext};
use crate::error::{OrchestrationError, Result};
use async_trait::async_trait;
use conductor_abstraction::Storage;
use serde_json::{Value, json};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Collection inventory records live in unless configured otherwise.
pub const DEFAULT_INVENTORY_COLLECTION: &str = "inventory";

/// Places a SKU may appear in the input, in lookup order.
const SKU_POINTERS: [&str; 4] = ["/params/sku", "/sku", "/input/params/sku", "/input/sku"];

/// Answers stock questions for a single SKU.
///
/// Records are keyed by SKU and carry at least an integer `stock` field. A
/// missing record or a malformed `stock` is a validation failure; an unreachable store is transient so the
/// caller's retry policy applies.
pub struct InventoryAgent {
    config: AgentConfig,
    storage: Arc<dyn Storage>,
    collection: String,
}

impl fmt::Debug for InventoryAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InventoryAgent")
            .field("id", &self.config.id)
            .field("collection", &self.collection)
            .finish_non_exhaustive()
    }
}

impl InventoryAgent {
    /// Creates an agent reading the default collection.
    ///
    /// # Arguments
    /// * `config` - Agent configuration
    /// * `storage` - Storage collaborator holding the inventory records
    #[must_use]
    pub fn new(config: AgentConfig, storage: Arc<dyn Storage>) -> Self {
        Self { config, storage, collection: DEFAULT_INVENTORY_COLLECTION.to_string() }
    }

    /// Reads records from `collection` instead.
    #[must_use]
    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    /// Collection records are read from.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    fn sku<'a>(context: &'a AgentContext) -> Option<&'a str> {
        SKU_POINTERS.iter().find_map(|pointer| context.str_field(pointer))
    }
}

#[async_trait]
impl Agent for InventoryAgent {
    fn config(&self) -> &AgentConfig {
        &self.config
    }

    async fn run(&self, context: AgentContext) -> Result<Value> {
        let sku = Self::sku(&context)
            .ok_or_else(|| OrchestrationError::Validation("no SKU in request".into()))?
            .to_uppercase();

        context.report_progress(10, "lookup", format!("Looking up {}", sku));
        debug!(agent_id = %self.config.id, sku = %sku, "Inventory lookup");

        let record = self.storage.find_by_id(&self.collection, &sku).await.map_err(|e| {
            warn!(agent_id = %self.config.id, sku = %sku, error = %e, "Inventory lookup failed");
            OrchestrationError::from(e)
        })?;
        let Some(record) = record else {
            return Err(OrchestrationError::Validation(format!("unknown SKU '{}'", sku)));
        };

        let Some(stock) = record.get("stock").and_then(Value::as_i64) else {
            warn!(agent_id = %self.config.id, sku = %sku, "Inventory record has no integer stock");
            return Err(OrchestrationError::Validation(format!(
                "SKU '{}' has a malformed stock value",
                sku
            )));
        };
        context.report_progress(100, "done", format!("{} units of {}", stock, sku));

        Ok(json!({
            "sku": sku,
            "stock": stock,
            "in_stock": stock > 0,
            "warehouse": record.get("warehouse").cloned().unwrap_or(Value::Null),
        }))
    }
}
