//! Agent registry.
//!
//! The registry is the one structure shared by every component. It only
//! observes lifecycle: agents are registered after `initialize` succeeds and
//! unregister themselves during `cleanup`. Every operation runs under a single
//! `RwLock`, so no caller ever sees a half-applied cascade.

use crate::error::{OrchestrationError, Result};
use crate::lifecycle::{AgentHandle, AgentState};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Position of an agent in the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    /// Top-level agent.
    Main,
    /// Agent delegated to by a parent.
    Sub,
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Main => write!(f, "main"),
            Self::Sub => write!(f, "sub"),
        }
    }
}

/// Registration options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Role in the hierarchy.
    pub role: AgentRole,
    /// Parent agent, required for sub-agents.
    pub parent_id: Option<String>,
    /// Routing tags.
    pub tags: BTreeSet<String>,
}

impl Registration {
    /// Registration for a main agent.
    #[must_use]
    pub fn main() -> Self {
        Self { role: AgentRole::Main, parent_id: None, tags: BTreeSet::new() }
    }

    /// Registration for a sub-agent of `parent_id`.
    #[must_use]
    pub fn sub(parent_id: impl Into<String>) -> Self {
        Self { role: AgentRole::Sub, parent_id: Some(parent_id.into()), tags: BTreeSet::new() }
    }

    /// Adds a routing tag.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Adds several routing tags.
    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }
}

/// A registered agent.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    /// The live handle.
    pub handle: Arc<AgentHandle>,
    /// Role in the hierarchy.
    pub role: AgentRole,
    /// Parent agent, if any.
    pub parent_id: Option<String>,
    /// Routing tags.
    pub tags: BTreeSet<String>,
}

impl RegistryEntry {
    /// Agent ID.
    pub fn id(&self) -> &str {
        self.handle.id()
    }

    /// `true` if the entry carries `tag`.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    fn is_live(&self) -> bool {
        !self.handle.state().is_shutting_down()
    }
}

/// Numeric suffix of an agent ID, used as a stable tie-breaker.
///
/// IDs without trailing digits sort after every numbered ID.
#[must_use]
pub fn numeric_suffix(id: &str) -> u64 {
    let digits = id.len() - id.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    id[id.len() - digits..].parse().unwrap_or(u64::MAX)
}

/// Load-aware ordering: fewer in-flight tasks, then lowest numeric ID, then ID.
pub(crate) fn load_key(handle: &AgentHandle) -> (usize, u64, String) {
    (handle.in_flight(), numeric_suffix(handle.id()), handle.id().to_string())
}

/// Registry of live agents.
pub struct AgentRegistry {
    entries: RwLock<HashMap<String, RegistryEntry>>,
}

impl fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agent_count", &self.entries.try_read().map(|e| e.len()).unwrap_or(0))
            .finish_non_exhaustive()
    }
}

impl AgentRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self { entries: RwLock::new(HashMap::new()) }
    }

    /// Registers an initialized agent.
    ///
    /// # Arguments
    /// * `handle` - A handle in the `Ready` state
    /// * `registration` - Role, parent and tags
    ///
    /// # Errors
    /// `DuplicateId` if the ID is taken, `IllegalState` if the handle is not
    /// `Ready`, `AgentNotFound` if the declared parent is not registered.
    pub async fn register(
        self: &Arc<Self>,
        handle: Arc<AgentHandle>,
        registration: Registration,
    ) -> Result<()> {
        let id = handle.id().to_string();
        let state = handle.state();
        if state != AgentState::Ready {
            return Err(OrchestrationError::IllegalState {
                agent_id: id,
                operation: "register",
                state,
            });
        }
        if registration.role == AgentRole::Sub && registration.parent_id.is_none() {
            return Err(OrchestrationError::Configuration(format!(
                "sub-agent '{}' has no parent",
                id
            )));
        }

        let mut entries = self.entries.write().await;
        if entries.contains_key(&id) {
            return Err(OrchestrationError::DuplicateId(id));
        }
        if let Some(parent_id) = &registration.parent_id {
            if !entries.contains_key(parent_id) {
                return Err(OrchestrationError::AgentNotFound(parent_id.clone()));
            }
        }

        debug!(
            agent_id = %id,
            role = %registration.role,
            parent_id = ?registration.parent_id,
            tags = ?registration.tags,
            "Registering agent"
        );
        handle.attach_registry(Arc::downgrade(self));
        entries.insert(
            id,
            RegistryEntry {
                handle,
                role: registration.role,
                parent_id: registration.parent_id,
                tags: registration.tags,
            },
        );
        Ok(())
    }

    /// Unregisters an agent and, transitively, every descendant.
    ///
    /// Idempotent: an unknown ID removes nothing.
    ///
    /// # Returns
    /// The removed IDs, the requested one first.
    pub async fn unregister(&self, id: &str) -> Vec<String> {
        let mut entries = self.entries.write().await;
        if entries.remove(id).is_none() {
            debug!(agent_id = %id, "Agent not registered, nothing to remove");
            return Vec::new();
        }

        let mut removed = vec![id.to_string()];
        let mut cursor = 0;
        while cursor < removed.len() {
            let parent = removed[cursor].clone();
            let mut children: Vec<String> = entries
                .values()
                .filter(|entry| entry.parent_id.as_deref() == Some(parent.as_str()))
                .map(|entry| entry.id().to_string())
                .collect();
            children.sort();
            for child in children {
                entries.remove(&child);
                removed.push(child);
            }
            cursor += 1;
        }

        debug!(agent_id = %id, removed = ?removed, "Unregistered agent");
        removed
    }

    /// Looks up a live agent by ID.
    pub async fn find_by_id(&self, id: &str) -> Option<RegistryEntry> {
        let entries = self.entries.read().await;
        entries.get(id).filter(|entry| entry.is_live()).cloned()
    }

    /// Every live agent carrying `tag`, ordered by ID.
    pub async fn find_by_tag(&self, tag: &str) -> Vec<RegistryEntry> {
        let entries = self.entries.read().await;
        let mut found: Vec<_> = entries
            .values()
            .filter(|entry| entry.has_tag(tag) && entry.is_live())
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id().cmp(b.id()));
        found
    }

    /// Picks the least-loaded enabled agent carrying `tag`.
    ///
    /// Ties go to the lowest numeric ID suffix.
    pub async fn select_by_tag(&self, tag: &str) -> Option<RegistryEntry> {
        self.find_by_tag(tag)
            .await
            .into_iter()
            .filter(|entry| entry.handle.config().enabled)
            .min_by_key(|entry| load_key(&entry.handle))
    }

    /// IDs of the direct children of `parent_id`.
    pub async fn children_of(&self, parent_id: &str) -> Vec<String> {
        let entries = self.entries.read().await;
        let mut children: Vec<_> = entries
            .values()
            .filter(|entry| entry.parent_id.as_deref() == Some(parent_id))
            .map(|entry| entry.id().to_string())
            .collect();
        children.sort();
        children
    }

    /// Every registered agent, ordered by ID.
    pub async fn list(&self) -> Vec<RegistryEntry> {
        let entries = self.entries.read().await;
        let mut all: Vec<_> = entries.values().cloned().collect();
        all.sort_by(|a, b| a.id().cmp(b.id()));
        all
    }

    /// `true` if `id` is registered.
    pub async fn is_registered(&self, id: &str) -> bool {
        self.entries.read().await.contains_key(id)
    }

    /// Number of registered agents.
    pub async fn count(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Initializes an agent and registers it on success.
    ///
    /// # Errors
    /// The initialization error, or the registration error. In the latter case
    /// the freshly initialized agent is cleaned up again.
    pub async fn spawn(
        self: &Arc<Self>,
        handle: Arc<AgentHandle>,
        registration: Registration,
    ) -> Result<Arc<AgentHandle>> {
        handle.initialize().await?;
        if let Err(e) = self.register(Arc::clone(&handle), registration).await {
            warn!(agent_id = %handle.id(), error = %e, "Registration failed, cleaning up");
            if let Err(cleanup_err) = handle.cleanup().await {
                warn!(agent_id = %handle.id(), error = %cleanup_err, "Cleanup failed");
            }
            return Err(e);
        }
        Ok(handle)
    }

    /// Cleans up every registered agent, children before parents.
    ///
    /// # Returns
    /// The number of agents that were cleaned up.
    pub async fn shutdown(&self) -> usize {
        let ordered = {
            let entries = self.entries.read().await;
            let depth = |entry: &RegistryEntry| {
                let mut depth = 0usize;
                let mut parent = entry.parent_id.as_deref();
                while let Some(id) = parent {
                    depth += 1;
                    parent = entries.get(id).and_then(|p| p.parent_id.as_deref());
                    if depth > entries.len() {
                        break;
                    }
                }
                depth
            };
            let mut ordered: Vec<_> =
                entries.values().map(|entry| (depth(entry), Arc::clone(&entry.handle))).collect();
            ordered.sort_by(|(da, a), (db, b)| db.cmp(da).then_with(|| a.id().cmp(b.id())));
            ordered
        };

        let count = ordered.len();
        for (_, handle) in ordered {
            if let Err(e) = handle.cleanup().await {
                warn!(agent_id = %handle.id(), error = %e, "Cleanup during shutdown failed");
            }
        }
        // Entries whose cleanup was already done elsewhere never unregistered.
        self.entries.write().await.clear();
        info!(agents = count, "Registry shut down");
        count
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, AgentConfig, AgentContext};
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::sync::Mutex;

    struct NoopAgent {
        config: AgentConfig,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Agent for NoopAgent {
        fn config(&self) -> &AgentConfig {
            &self.config
        }

        async fn run(&self, context: AgentContext) -> Result<Value> {
            if let Some(ms) = context.data.get("hold_ms").and_then(Value::as_u64) {
                tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
            }
            Ok(context.data)
        }

        async fn cleanup(&self) -> Result<()> {
            self.log.lock().unwrap().push(self.config.id.clone());
            Ok(())
        }
    }

    fn handle(id: &str, log: &Arc<Mutex<Vec<String>>>) -> Arc<AgentHandle> {
        Arc::new(AgentHandle::new(Arc::new(NoopAgent {
            config: AgentConfig::new(id, id),
            log: Arc::clone(log),
        })))
    }

    #[test]
    fn test_numeric_suffix() {
        assert_eq!(numeric_suffix("inventory-2"), 2);
        assert_eq!(numeric_suffix("inventory-10"), 10);
        assert_eq!(numeric_suffix("agent7"), 7);
        assert_eq!(numeric_suffix("supervisor"), u64::MAX);
    }

    #[tokio::test]
    async fn test_register_requires_ready() {
        let log = Arc::default();
        let registry = Arc::new(AgentRegistry::new());
        let err = registry.register(handle("a", &log), Registration::main()).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::IllegalState { .. }));
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let log = Arc::default();
        let registry = Arc::new(AgentRegistry::new());
        registry.spawn(handle("a", &log), Registration::main()).await.unwrap();

        let err = registry.spawn(handle("a", &log), Registration::main()).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::DuplicateId(id) if id == "a"));
        assert_eq!(registry.count().await, 1);
        // The rejected duplicate was cleaned up; the original was not.
        assert_eq!(*log.lock().unwrap(), vec!["a".to_string()]);
        assert!(registry.find_by_id("a").await.is_some());
    }

    #[tokio::test]
    async fn test_sub_requires_registered_parent() {
        let log = Arc::default();
        let registry = Arc::new(AgentRegistry::new());
        let err =
            registry.spawn(handle("child", &log), Registration::sub("ghost")).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::AgentNotFound(_)));
    }

    #[tokio::test]
    async fn test_unregister_cascades() {
        let log = Arc::default();
        let registry = Arc::new(AgentRegistry::new());
        registry.spawn(handle("root", &log), Registration::main()).await.unwrap();
        registry.spawn(handle("mid", &log), Registration::sub("root")).await.unwrap();
        registry.spawn(handle("leaf", &log), Registration::sub("mid")).await.unwrap();
        registry.spawn(handle("other", &log), Registration::main()).await.unwrap();

        let removed = registry.unregister("root").await;
        assert_eq!(removed, vec!["root", "mid", "leaf"]);
        assert!(registry.find_by_id("mid").await.is_none());
        assert!(registry.find_by_id("leaf").await.is_none());
        assert!(registry.find_by_id("other").await.is_some());

        assert!(registry.unregister("root").await.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_unregisters() {
        let log = Arc::default();
        let registry = Arc::new(AgentRegistry::new());
        let parent = registry.spawn(handle("p", &log), Registration::main()).await.unwrap();
        registry.spawn(handle("c", &log), Registration::sub("p")).await.unwrap();

        parent.cleanup().await.unwrap();
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_select_by_tag_prefers_lowest_numeric_id() {
        let log = Arc::default();
        let registry = Arc::new(AgentRegistry::new());
        for id in ["inventory-10", "inventory-2", "inventory-3"] {
            registry
                .spawn(handle(id, &log), Registration::main().with_tag("inventory"))
                .await
                .unwrap();
        }

        let chosen = registry.select_by_tag("inventory").await.unwrap();
        assert_eq!(chosen.id(), "inventory-2");
        assert_eq!(registry.find_by_tag("inventory").await.len(), 3);
        assert!(registry.select_by_tag("billing").await.is_none());
    }

    #[tokio::test]
    async fn test_select_by_tag_prefers_idle_over_lower_id() {
        let log = Arc::default();
        let registry = Arc::new(AgentRegistry::new());
        let busy = registry
            .spawn(handle("inv-1", &log), Registration::main().with_tag("inventory"))
            .await
            .unwrap();
        registry
            .spawn(handle("inv-2", &log), Registration::main().with_tag("inventory"))
            .await
            .unwrap();

        let running = tokio::spawn({
            let busy = Arc::clone(&busy);
            async move { busy.run(AgentContext::new(json!({"hold_ms": 100}))).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(busy.in_flight(), 1);
        assert_eq!(registry.select_by_tag("inventory").await.unwrap().id(), "inv-2");

        assert!(running.await.unwrap().success);
        assert_eq!(registry.select_by_tag("inventory").await.unwrap().id(), "inv-1");
    }

    #[tokio::test]
    async fn test_select_by_tag_skips_disabled() {
        let log = Arc::default();
        let registry = Arc::new(AgentRegistry::new());
        let first = registry
            .spawn(handle("inv-1", &log), Registration::main().with_tag("inventory"))
            .await
            .unwrap();
        registry
            .spawn(handle("inv-2", &log), Registration::main().with_tag("inventory"))
            .await
            .unwrap();

        first.update_config(|c| c.enabled = false).unwrap();
        assert_eq!(registry.select_by_tag("inventory").await.unwrap().id(), "inv-2");
    }

    #[tokio::test]
    async fn test_shutdown_cleans_children_first() {
        let log: Arc<Mutex<Vec<String>>> = Arc::default();
        let registry = Arc::new(AgentRegistry::new());
        registry.spawn(handle("root", &log), Registration::main()).await.unwrap();
        registry.spawn(handle("mid", &log), Registration::sub("root")).await.unwrap();
        registry.spawn(handle("leaf", &log), Registration::sub("mid")).await.unwrap();

        assert_eq!(registry.shutdown().await, 3);
        assert_eq!(*log.lock().unwrap(), vec!["leaf", "mid", "root"]);
        assert_eq!(registry.count().await, 0);
    }
}
