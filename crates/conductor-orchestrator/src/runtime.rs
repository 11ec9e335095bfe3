//! Assembles a running system from a [`ConductorConfig`].

use crate::agent::Agent;
use crate::agents::{EchoAgent, EscalationAgent, InventoryAgent};
use crate::config::{AgentKind, ConductorConfig, RosterEntry};
use crate::error::Result;
use crate::escalation::Escalator;
use crate::lifecycle::AgentHandle;
use crate::registry::AgentRegistry;
use crate::routing::{AgentRouter, IntentClassifier};
use crate::supervisor::Supervisor;
use crate::workflow::{WorkflowCatalog, WorkflowOrchestrator};
use conductor_abstraction::{MemoryStorage, Notifier, Storage};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// A fully wired Conductor instance.
///
/// Owns the agent registry, the workflow orchestrator and the supervisor built
/// on top of them. Call [`Runtime::shutdown`] to clean up every agent.
pub struct Runtime {
    config: ConductorConfig,
    storage: Arc<MemoryStorage>,
    escalator: Arc<Escalator>,
    registry: Arc<AgentRegistry>,
    workflows: Arc<WorkflowOrchestrator>,
    supervisor: Supervisor,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("agents", &self.config.agents.len())
            .field("workflows", &self.config.workflows.len())
            .field("escalator", &self.escalator)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Validates the configuration, seeds storage and spawns the roster.
    ///
    /// Agents are spawned parents first. If any agent fails to spawn, the ones
    /// already running are shut down again.
    ///
    /// # Arguments
    /// * `config` - The configuration to build from
    /// * `notifier` - Sink for escalations
    ///
    /// # Errors
    /// Any validation error, or the first spawn error.
    pub async fn from_config(config: ConductorConfig, notifier: Arc<dyn Notifier>) -> Result<Self> {
        config.validate()?;

        let storage = Arc::new(MemoryStorage::new());
        for (collection, records) in &config.seed {
            for (id, record) in records {
                storage.seed(collection, id, record.clone());
            }
        }

        let escalator = Arc::new(
            Escalator::new(notifier)
                .with_threshold(config.escalation.threshold)
                .with_channel(config.escalation.channel.clone()),
        );
        let classifier = Arc::new(IntentClassifier::from_config(&config.classifier)?);
        let catalog = WorkflowCatalog::load(config.workflows.iter().cloned())?;

        let registry = Arc::new(AgentRegistry::new());
        for member in config.spawn_order()? {
            let handle = AgentHandle::new(build_agent(member, &storage, &escalator))
                .with_escalator(Arc::clone(&escalator));
            if let Err(e) = registry.spawn(Arc::new(handle), member.registration()).await {
                warn!(agent_id = %member.config.id, error = %e, "Agent failed to spawn");
                registry.shutdown().await;
                return Err(e);
            }
        }

        let shared: Arc<dyn Storage> = storage.clone();
        let workflows = Arc::new(
            WorkflowOrchestrator::new(catalog, Arc::clone(&registry))
                .with_max_concurrency(config.orchestrator.max_concurrency)
                .with_default_retry(config.orchestrator.default_retry())
                .with_escalator(Arc::clone(&escalator))
                .with_storage(shared),
        );
        let router = AgentRouter::new(classifier, config.routing.clone(), Arc::clone(&registry))?
            .with_workflows(Arc::clone(&workflows));
        let supervisor = Supervisor::new(Arc::new(router), Arc::clone(&registry))
            .with_workflows(Arc::clone(&workflows));

        info!(
            agents = registry.count().await,
            workflows = config.workflows.len(),
            "Runtime started"
        );
        Ok(Self { config, storage, escalator, registry, workflows, supervisor })
    }

    /// The configuration the runtime was built from.
    pub fn config(&self) -> &ConductorConfig {
        &self.config
    }

    /// The seeded in-memory store.
    pub fn storage(&self) -> &Arc<MemoryStorage> {
        &self.storage
    }

    /// The agent registry.
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// The workflow orchestrator.
    pub fn workflows(&self) -> &Arc<WorkflowOrchestrator> {
        &self.workflows
    }

    /// The request supervisor.
    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Cleans up every agent.
    ///
    /// # Returns
    /// The number of agents that were cleaned up.
    pub async fn shutdown(&self) -> usize {
        let count = self.registry.shutdown().await;
        info!(agents = count, "Runtime stopped");
        count
    }
}

fn build_agent(
    member: &RosterEntry,
    storage: &Arc<MemoryStorage>,
    escalator: &Arc<Escalator>,
) -> Arc<dyn Agent> {
    let config = member.config.clone();
    match member.kind {
        AgentKind::Echo => Arc::new(EchoAgent::new(config)),
        AgentKind::Escalation => Arc::new(EscalationAgent::new(config, Arc::clone(escalator))),
        AgentKind::Inventory => {
            let shared: Arc<dyn Storage> = storage.clone();
            let agent = InventoryAgent::new(config, shared);
            match &member.collection {
                Some(collection) => Arc::new(agent.with_collection(collection.clone())),
                None => Arc::new(agent),
            }
        }
    }
}
