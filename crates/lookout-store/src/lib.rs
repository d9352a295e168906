//! # lookout-store
//!
//! The persistence collaborator: agent definitions, response-handler code
//! payloads, and per-agent memory. The runtime only sees the [`AgentStore`]
//! trait; storage format is this crate's business.

pub mod mem;
pub mod sqlite;

pub use mem::MemStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;

use lookout_core::{AgentDefinition, Result};

/// Storage seam for agent definitions and memory.
///
/// Memory appends may interleave across agents; last-write-wins on the
/// underlying store is the contract — the scheduler guarantees ordering
/// only within a single agent's iterations.
#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn load_agent(&self, id: &str) -> Result<AgentDefinition>;

    async fn list_agents(&self) -> Result<Vec<AgentDefinition>>;

    /// The agent's response-handler code payload: a base64-encoded WASM
    /// module (string transport, so storage stays format-agnostic).
    async fn load_code(&self, id: &str) -> Result<String>;

    async fn save_agent(&self, def: &AgentDefinition, code: &str) -> Result<()>;

    async fn get_memory(&self, id: &str) -> Result<String>;

    async fn set_memory(&self, id: &str, value: &str) -> Result<()>;

    /// Append `value` to the agent's memory, inserting `separator` when
    /// the existing memory is non-empty.
    async fn append_memory(&self, id: &str, value: &str, separator: &str) -> Result<()>;
}
