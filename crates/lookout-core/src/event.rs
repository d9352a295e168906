use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::types::{AgentId, StreamKind};

/// Events flowing through the system. Fire-and-forget: listeners (UI,
/// recorder, tests) subscribe; nobody acknowledges.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    // ── Agent lifecycle ────────────────────────────────────────
    AgentStarted {
        agent: AgentId,
    },
    AgentStopped {
        agent: AgentId,
    },

    // ── Iteration lifecycle ────────────────────────────────────
    IterationStarted {
        agent: AgentId,
        iteration: u64,
    },
    /// The raw model response for an iteration, for live UI updates.
    IterationOutput {
        agent: AgentId,
        iteration: u64,
        text: String,
    },
    IterationFinished {
        agent: AgentId,
        iteration: u64,
        ok: bool,
    },

    // ── Memory ─────────────────────────────────────────────────
    MemoryUpdated {
        agent: AgentId,
    },

    // ── Streams ────────────────────────────────────────────────
    /// Full snapshot of currently open capture streams, published on
    /// every acquire/release/end.
    StreamsChanged {
        active: Vec<StreamKind>,
    },
    /// The hardware source ended the stream unilaterally.
    StreamEnded {
        kind: StreamKind,
    },

    // ── Recording ──────────────────────────────────────────────
    RecordingSaved {
        id: Uuid,
    },

    // ── Tools ──────────────────────────────────────────────────
    NotificationRequested {
        title: String,
        body: String,
    },

    // ── System ─────────────────────────────────────────────────
    Shutdown,
}

/// A broadcast-based event bus for system-wide pub/sub.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<Event>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn publish(&self, event: Event) {
        // Ignore send errors (no subscribers).
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(4096)
    }
}
