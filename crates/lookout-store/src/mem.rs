//! In-memory agent store for tests and ephemeral runs.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

use lookout_core::{AgentDefinition, LookoutError, Result};

use crate::AgentStore;

#[derive(Default)]
struct MemState {
    agents: HashMap<String, AgentDefinition>,
    code: HashMap<String, String>,
    memory: HashMap<String, String>,
}

/// Everything in a `HashMap`; writes are last-write-wins like the SQLite
/// store.
#[derive(Default)]
pub struct MemStore {
    state: Mutex<MemState>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder convenience for tests.
    pub fn with_agent(self, def: AgentDefinition, code: &str) -> Self {
        {
            let mut state = self.state.lock();
            state.code.insert(def.id.clone(), code.to_string());
            state.agents.insert(def.id.clone(), def);
        }
        self
    }
}

#[async_trait]
impl AgentStore for MemStore {
    async fn load_agent(&self, id: &str) -> Result<AgentDefinition> {
        self.state
            .lock()
            .agents
            .get(id)
            .cloned()
            .ok_or_else(|| LookoutError::AgentNotFound(id.to_string()))
    }

    async fn list_agents(&self) -> Result<Vec<AgentDefinition>> {
        let mut agents: Vec<_> = self.state.lock().agents.values().cloned().collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(agents)
    }

    async fn load_code(&self, id: &str) -> Result<String> {
        self.state
            .lock()
            .code
            .get(id)
            .cloned()
            .ok_or_else(|| LookoutError::AgentNotFound(id.to_string()))
    }

    async fn save_agent(&self, def: &AgentDefinition, code: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.code.insert(def.id.clone(), code.to_string());
        state.agents.insert(def.id.clone(), def.clone());
        Ok(())
    }

    async fn get_memory(&self, id: &str) -> Result<String> {
        Ok(self.state.lock().memory.get(id).cloned().unwrap_or_default())
    }

    async fn set_memory(&self, id: &str, value: &str) -> Result<()> {
        self.state
            .lock()
            .memory
            .insert(id.to_string(), value.to_string());
        Ok(())
    }

    async fn append_memory(&self, id: &str, value: &str, separator: &str) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state.memory.entry(id.to_string()).or_default();
        if entry.is_empty() {
            entry.push_str(value);
        } else {
            entry.push_str(separator);
            entry.push_str(value);
        }
        Ok(())
    }
}
