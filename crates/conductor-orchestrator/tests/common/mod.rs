//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use conductor_orchestrator::{
    Agent, AgentConfig, AgentContext, AgentHandle, OrchestrationError, Result,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Agent that fails a fixed number of times with a transient error, then
/// succeeds. Counts every lifecycle call.
#[derive(Debug)]
pub struct ScriptedAgent {
    config: AgentConfig,
    failures: u32,
    runs: AtomicU32,
    inits: AtomicU32,
    cleanups: AtomicU32,
}

impl ScriptedAgent {
    /// Agent that always succeeds.
    pub fn ok(id: &str) -> Arc<Self> {
        Self::failing(id, 0)
    }

    /// Agent whose first `failures` runs fail.
    pub fn failing(id: &str, failures: u32) -> Arc<Self> {
        let config = AgentConfig::new(id, id).with_retry(0, Duration::from_millis(1));
        Arc::new(Self {
            config,
            failures,
            runs: AtomicU32::new(0),
            inits: AtomicU32::new(0),
            cleanups: AtomicU32::new(0),
        })
    }

    /// Agent whose every run fails.
    pub fn broken(id: &str) -> Arc<Self> {
        Self::failing(id, u32::MAX)
    }

    pub fn runs(&self) -> u32 {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn inits(&self) -> u32 {
        self.inits.load(Ordering::SeqCst)
    }

    pub fn cleanups(&self) -> u32 {
        self.cleanups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn config(&self) -> &AgentConfig {
        &self.config
    }

    async fn initialize(&self) -> Result<()> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn run(&self, context: AgentContext) -> Result<Value> {
        let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        if run <= self.failures {
            return Err(OrchestrationError::Transient(format!(
                "{} failed on run {}",
                self.config.id, run
            )));
        }
        Ok(json!({ "agent": self.config.id, "run": run, "seen": context.data }))
    }

    async fn cleanup(&self) -> Result<()> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Wraps a scripted agent in a fresh handle.
pub fn handle(agent: &Arc<ScriptedAgent>) -> Arc<AgentHandle> {
    let agent: Arc<dyn Agent> = Arc::clone(agent) as Arc<dyn Agent>;
    Arc::new(AgentHandle::new(agent))
}
