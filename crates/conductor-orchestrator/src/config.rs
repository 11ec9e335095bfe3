//! Conductor configuration.
//!
//! A single TOML document declares the classifier rules, the routing table,
//! orchestrator limits, escalation settings, the agent roster, workflow
//! definitions and seed records for the in-memory store. Every section has a
//! built-in default, so an empty file is a valid configuration.

use crate::agent::{AgentConfig, ApprovalLevel};
use crate::error::{OrchestrationError, Result};
use crate::escalation::{DEFAULT_CHANNEL, Severity};
use crate::lifecycle::RetryPolicy;
use crate::registry::{AgentRole, Registration};
use crate::routing::{ClassifierConfig, IntentClassifier, RoutingConfig};
use crate::workflow::{
    DEFAULT_MAX_CONCURRENCY, StepTarget, WorkflowCatalog, WorkflowDefinition, WorkflowStep,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "CONDUCTOR_CONFIG";

/// Configuration file looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "conductor.toml";

/// Workflow orchestrator limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    /// Steps running at once per execution.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Retry budget for steps that declare none.
    #[serde(default = "default_step_max_retries")]
    pub step_max_retries: u32,
    /// Retry delay for steps that declare none, in milliseconds.
    #[serde(default = "default_step_retry_delay_ms")]
    pub step_retry_delay_ms: u64,
}

fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}

fn default_step_max_retries() -> u32 {
    3
}

fn default_step_retry_delay_ms() -> u64 {
    1_000
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            step_max_retries: default_step_max_retries(),
            step_retry_delay_ms: default_step_retry_delay_ms(),
        }
    }
}

impl OrchestratorSettings {
    /// Retry policy for steps that declare none.
    #[must_use]
    pub fn default_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.step_max_retries, Duration::from_millis(self.step_retry_delay_ms))
    }
}

/// Escalation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationSettings {
    /// Minimum severity forwarded to the notifier.
    #[serde(default)]
    pub threshold: Severity,
    /// Notification channel.
    #[serde(default = "default_channel")]
    pub channel: String,
}

fn default_channel() -> String {
    DEFAULT_CHANNEL.to_string()
}

impl Default for EscalationSettings {
    fn default() -> Self {
        Self { threshold: Severity::default(), channel: default_channel() }
    }
}

/// Built-in agent implementations the roster can instantiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    /// Returns its input.
    Echo,
    /// Looks up stock levels in storage.
    Inventory,
    /// Catch-all that escalates and asks for clarification.
    Escalation,
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Echo => write!(f, "echo"),
            Self::Inventory => write!(f, "inventory"),
            Self::Escalation => write!(f, "escalation"),
        }
    }
}

fn default_role() -> AgentRole {
    AgentRole::Main
}

/// One entry of the `[[agents]]` roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    /// Implementation to instantiate.
    pub kind: AgentKind,
    /// Role in the hierarchy.
    #[serde(default = "default_role")]
    pub role: AgentRole,
    /// Parent agent, for sub-agents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Routing tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Storage collection, for inventory agents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    /// Lifecycle configuration.
    #[serde(flatten)]
    pub config: AgentConfig,
}

impl RosterEntry {
    /// Creates a main agent entry.
    #[must_use]
    pub fn new(kind: AgentKind, config: AgentConfig) -> Self {
        Self { kind, role: AgentRole::Main, parent: None, tags: Vec::new(), collection: None, config }
    }

    /// Makes the entry a sub-agent of `parent`.
    #[must_use]
    pub fn under(mut self, parent: impl Into<String>) -> Self {
        self.role = AgentRole::Sub;
        self.parent = Some(parent.into());
        self
    }

    /// Adds a routing tag.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Registry options for this entry.
    #[must_use]
    pub fn registration(&self) -> Registration {
        let registration = match (&self.role, &self.parent) {
            (AgentRole::Sub, Some(parent)) => Registration::sub(parent.clone()),
            _ => Registration::main(),
        };
        registration.with_tags(self.tags.iter().cloned())
    }
}

/// Seed records: collection, then record ID, then record.
pub type SeedData = BTreeMap<String, BTreeMap<String, Value>>;

/// Where a configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// The file named by `CONDUCTOR_CONFIG`.
    Env(PathBuf),
    /// `conductor.toml` in the working directory.
    Local(PathBuf),
    /// An explicitly given file.
    File(PathBuf),
    /// Built-in defaults.
    Defaults,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Env(path) => write!(f, "{} (from {})", path.display(), CONFIG_ENV),
            Self::Local(path) | Self::File(path) => write!(f, "{}", path.display()),
            Self::Defaults => write!(f, "built-in defaults"),
        }
    }
}

/// Complete Conductor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConductorConfig {
    /// Intent classifier rules.
    #[serde(default)]
    pub classifier: ClassifierConfig,
    /// Routing table.
    #[serde(default)]
    pub routing: RoutingConfig,
    /// Workflow orchestrator limits.
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
    /// Escalation settings.
    #[serde(default)]
    pub escalation: EscalationSettings,
    /// Agent roster.
    #[serde(default = "default_agents")]
    pub agents: Vec<RosterEntry>,
    /// Workflow definitions.
    #[serde(default = "default_workflows")]
    pub workflows: Vec<WorkflowDefinition>,
    /// Seed records for the in-memory store.
    #[serde(default = "default_seed")]
    pub seed: SeedData,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            classifier: ClassifierConfig::default(),
            routing: RoutingConfig::default(),
            orchestrator: OrchestratorSettings::default(),
            escalation: EscalationSettings::default(),
            agents: default_agents(),
            workflows: default_workflows(),
            seed: default_seed(),
        }
    }
}

/// The built-in agent roster.
#[must_use]
pub fn default_agents() -> Vec<RosterEntry> {
    vec![
        RosterEntry::new(
            AgentKind::Escalation,
            AgentConfig::new("escalation", "Escalation desk")
                .with_description("Catch-all handler that escalates and asks for clarification"),
        ),
        RosterEntry::new(
            AgentKind::Inventory,
            AgentConfig::new("inventory-1", "Inventory")
                .with_description("Looks up stock levels by SKU"),
        )
        .with_tag("inventory"),
        RosterEntry::new(
            AgentKind::Echo,
            AgentConfig::new("orders-1", "Order desk").with_description("Reports order status"),
        )
        .with_tag("orders"),
        RosterEntry::new(
            AgentKind::Echo,
            AgentConfig::new("close-coordinator", "Close coordinator")
                .with_description("Owns the month-end close sub-agents"),
        ),
        RosterEntry::new(
            AgentKind::Echo,
            AgentConfig::new("ledger-1", "Ledger")
                .with_description("Reconciles ledgers")
                .with_approval_level(ApprovalLevel::Medium),
        )
        .under("close-coordinator")
        .with_tag("ledger"),
        RosterEntry::new(
            AgentKind::Echo,
            AgentConfig::new("reporting", "Reporting").with_description("Builds close reports"),
        )
        .under("close-coordinator")
        .with_tag("reporting"),
    ]
}

/// The built-in workflows.
#[must_use]
pub fn default_workflows() -> Vec<WorkflowDefinition> {
    vec![
        WorkflowDefinition::new("month_end_close", "Month-end close")
            .with_description("Reconcile, accrue, then report")
            .with_approval_level(ApprovalLevel::Medium)
            .with_step(WorkflowStep::new("reconcile", StepTarget::Tag("ledger".into())))
            .with_step(WorkflowStep::new("accruals", StepTarget::Tag("ledger".into())))
            .with_step(
                WorkflowStep::new("report", StepTarget::Agent("reporting".into()))
                    .depends_on("reconcile")
                    .depends_on("accruals"),
            ),
    ]
}

/// The built-in seed records.
#[must_use]
pub fn default_seed() -> SeedData {
    let inventory = BTreeMap::from([
        ("SKU-123".to_string(), json!({ "stock": 42, "warehouse": "north" })),
        ("SKU-456".to_string(), json!({ "stock": 0, "warehouse": "south" })),
    ]);
    BTreeMap::from([("inventory".to_string(), inventory)])
}

impl ConductorConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    /// `Toml` for syntax errors, `ConfigurationError` for invalid content.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a configuration file.
    ///
    /// # Arguments
    /// * `path` - Path to the TOML file
    ///
    /// # Errors
    /// `ConfigurationError` if the file cannot be read, or any parse or
    /// validation error.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            OrchestrationError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&content)?;
        debug!(path = %path.display(), agents = config.agents.len(), "Loaded configuration");
        Ok(config)
    }

    /// Finds and loads the configuration.
    ///
    /// Looks at `CONDUCTOR_CONFIG`, then `./conductor.toml`, then falls back to
    /// the built-in defaults.
    ///
    /// # Errors
    /// Any error from [`ConductorConfig::load`] for the file that was found.
    pub fn discover() -> Result<(Self, ConfigSource)> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(path);
            let config = Self::load(&path)?;
            info!(path = %path.display(), "Using configuration from {}", CONFIG_ENV);
            return Ok((config, ConfigSource::Env(path)));
        }

        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.is_file() {
            let config = Self::load(&local)?;
            return Ok((config, ConfigSource::Local(local)));
        }

        debug!("No configuration file found, using defaults");
        Ok((Self::default(), ConfigSource::Defaults))
    }

    /// Serializes the configuration to TOML.
    ///
    /// # Errors
    /// `ConfigurationError` if a value has no TOML representation.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| OrchestrationError::Configuration(format!("cannot serialize: {}", e)))
    }

    /// Checks the whole configuration for consistency.
    ///
    /// # Errors
    /// `ConfigurationError` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        IntentClassifier::from_config(&self.classifier)?;
        self.routing.validate()?;

        if self.orchestrator.max_concurrency == 0 {
            return Err(OrchestrationError::Configuration(
                "orchestrator.max_concurrency must be at least 1".into(),
            ));
        }
        if self.escalation.channel.trim().is_empty() {
            return Err(OrchestrationError::Configuration("escalation.channel must be set".into()));
        }

        WorkflowCatalog::load(self.workflows.iter().cloned())?;
        self.validate_agents()?;

        if !self.agents.is_empty() {
            self.validate_references()?;
        }
        Ok(())
    }

    fn validate_agents(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for member in &self.agents {
            member.config.validate()?;
            if !ids.insert(member.config.id.as_str()) {
                return Err(OrchestrationError::Configuration(format!(
                    "agent '{}' is declared twice",
                    member.config.id
                )));
            }
            match (member.role, &member.parent) {
                (AgentRole::Sub, None) => {
                    return Err(OrchestrationError::Configuration(format!(
                        "sub-agent '{}' has no parent",
                        member.config.id
                    )));
                }
                (AgentRole::Main, Some(_)) => {
                    return Err(OrchestrationError::Configuration(format!(
                        "main agent '{}' cannot have a parent",
                        member.config.id
                    )));
                }
                (AgentRole::Sub, Some(parent)) if parent == &member.config.id => {
                    return Err(OrchestrationError::Configuration(format!(
                        "agent '{}' is its own parent",
                        member.config.id
                    )));
                }
                _ => {}
            }
        }
        self.spawn_order().map(|_| ())
    }

    fn validate_references(&self) -> Result<()> {
        let declared: HashSet<&str> = self.agents.iter().map(|a| a.config.id.as_str()).collect();
        let workflows: HashSet<&str> = self.workflows.iter().map(|w| w.id.as_str()).collect();
        let missing = |what: &str, id: &str| {
            OrchestrationError::Configuration(format!("{} '{}' is not declared", what, id))
        };

        if !declared.contains(self.routing.catch_all.as_str()) {
            return Err(missing("catch-all agent", &self.routing.catch_all));
        }
        for route in &self.routing.categories {
            if let Some(agent) = &route.default_agent {
                if !declared.contains(agent.as_str()) {
                    return Err(missing("default agent", agent));
                }
            }
            if let Some(workflow) = &route.workflow {
                if !workflows.contains(workflow.as_str()) {
                    return Err(missing("workflow", workflow));
                }
            }
        }
        for workflow in &self.workflows {
            for step in &workflow.steps {
                if let StepTarget::Agent(id) = &step.target {
                    if !declared.contains(id.as_str()) {
                        return Err(missing("step agent", id));
                    }
                }
            }
        }
        Ok(())
    }

    /// The roster ordered so every parent precedes its children.
    ///
    /// # Errors
    /// `ConfigurationError` for an undeclared parent or a parent cycle.
    pub fn spawn_order(&self) -> Result<Vec<&RosterEntry>> {
        let by_id: HashMap<&str, &RosterEntry> =
            self.agents.iter().map(|a| (a.config.id.as_str(), a)).collect();
        let mut placed: HashSet<&str> = HashSet::new();
        let mut order = Vec::with_capacity(self.agents.len());

        while order.len() < self.agents.len() {
            let before = order.len();
            for member in &self.agents {
                let id = member.config.id.as_str();
                if placed.contains(id) {
                    continue;
                }
                match member.parent.as_deref() {
                    Some(parent) if !by_id.contains_key(parent) => {
                        return Err(OrchestrationError::Configuration(format!(
                            "agent '{}' names undeclared parent '{}'",
                            id, parent
                        )));
                    }
                    Some(parent) if !placed.contains(parent) => {}
                    _ => {
                        placed.insert(id);
                        order.push(member);
                    }
                }
            }
            if order.len() == before {
                return Err(OrchestrationError::Configuration(
                    "agent parents form a cycle".into(),
                ));
            }
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = ConductorConfig::default();
        config.validate().unwrap();
        let order: Vec<_> =
            config.spawn_order().unwrap().into_iter().map(|s| s.config.id.as_str()).collect();
        let coordinator = order.iter().position(|id| *id == "close-coordinator").unwrap();
        let ledger = order.iter().position(|id| *id == "ledger-1").unwrap();
        assert!(coordinator < ledger);
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = ConductorConfig::from_toml_str("").unwrap();
        assert_eq!(config, ConductorConfig::default());
    }

    #[test]
    fn test_full_document() {
        let config = ConductorConfig::from_toml_str(
            r#"
            workflows = []

            [classifier]
            confidence_floor = 0.7

            [[classifier.intents]]
            category = "inventory_query"
            keywords = ["inventory", "stock"]
            params = { sku = '(?i)\b(SKU-\d+)\b' }

            [routing]
            catch_all = "desk"

            [[routing.categories]]
            category = "inventory_query"
            tag = "inventory"
            approval_level = "medium"

            [orchestrator]
            max_concurrency = 2

            [escalation]
            threshold = "warning"
            channel = "ops"

            [[agents]]
            kind = "escalation"
            id = "desk"
            name = "Desk"

            [[agents]]
            kind = "inventory"
            id = "inv-1"
            name = "Inventory"
            tags = ["inventory"]
            timeout_ms = 500

            [seed.inventory.SKU-1]
            stock = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.classifier.confidence_floor, 0.7);
        assert_eq!(config.routing.catch_all, "desk");
        assert_eq!(config.routing.categories[0].approval_level, ApprovalLevel::Medium);
        assert_eq!(config.orchestrator.max_concurrency, 2);
        assert_eq!(config.escalation.threshold, Severity::Warning);
        assert_eq!(config.agents.len(), 2);
        assert_eq!(config.agents[1].config.timeout_ms, 500);
        assert_eq!(config.agents[1].config.max_retries, 3);
        assert!(config.workflows.is_empty());
        assert_eq!(config.seed["inventory"]["SKU-1"]["stock"], 3);
    }

    #[test]
    fn test_invalid_configurations() {
        let zero = "[orchestrator]\nmax_concurrency = 0\n";
        assert!(matches!(
            ConductorConfig::from_toml_str(zero),
            Err(OrchestrationError::Configuration(_))
        ));

        let missing_catch_all = "[routing]\ncatch_all = \"ghost\"\n";
        assert!(ConductorConfig::from_toml_str(missing_catch_all).is_err());

        let orphan = r#"
            [[agents]]
            kind = "echo"
            id = "escalation"
            name = "E"

            [[agents]]
            kind = "echo"
            id = "child"
            name = "C"
            role = "sub"
            parent = "ghost"
        "#;
        assert!(ConductorConfig::from_toml_str(orphan).is_err());

        let cyclic_workflow = r#"
            [[workflows]]
            id = "w"
            name = "W"

            [[workflows.steps]]
            id = "a"
            target = { tag = "x" }
            depends_on = ["b"]

            [[workflows.steps]]
            id = "b"
            target = { tag = "x" }
            depends_on = ["a"]
        "#;
        assert!(matches!(
            ConductorConfig::from_toml_str(cyclic_workflow),
            Err(OrchestrationError::Configuration(_))
        ));

        assert!(matches!(ConductorConfig::from_toml_str("[routing"), Err(OrchestrationError::Toml(_))));
    }

    #[test]
    fn test_parent_cycle_rejected() {
        let mut config = ConductorConfig::default();
        config.agents = vec![
            RosterEntry::new(AgentKind::Echo, AgentConfig::new("escalation", "E")),
            RosterEntry::new(AgentKind::Echo, AgentConfig::new("a", "A")).under("b"),
            RosterEntry::new(AgentKind::Echo, AgentConfig::new("b", "B")).under("a"),
        ];
        assert!(config.spawn_order().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[escalation]\nchannel = \"pager\"").unwrap();

        let config = ConductorConfig::load(file.path()).unwrap();
        assert_eq!(config.escalation.channel, "pager");

        let missing = ConductorConfig::load(Path::new("/nonexistent/conductor.toml"));
        assert!(matches!(missing, Err(OrchestrationError::Configuration(_))));
    }

    #[test]
    fn test_round_trip_through_toml() {
        let config = ConductorConfig::default();
        let text = config.to_toml_string().unwrap();
        assert_eq!(ConductorConfig::from_toml_str(&text).unwrap(), config);
    }
}
