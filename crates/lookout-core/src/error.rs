use thiserror::Error;

use crate::types::StreamKind;

/// Unified error type for the entire Lookout runtime.
#[derive(Error, Debug)]
pub enum LookoutError {
    // ── Stream / capture errors ────────────────────────────────
    #[error("stream acquisition failed: {kind}: {reason}")]
    Acquisition { kind: StreamKind, reason: String },

    #[error("stream ended unexpectedly: {0}")]
    StreamEnded(StreamKind),

    #[error("capture source does not provide {operation}: {kind}")]
    UnsupportedCapture {
        kind: StreamKind,
        operation: &'static str,
    },

    // ── Inference errors ───────────────────────────────────────
    #[error("inference error: {0}")]
    Inference(String),

    // ── Sandbox / tool errors ──────────────────────────────────
    #[error("sandbox execution failed: {tool}: {reason}")]
    Sandbox { tool: String, reason: String },

    #[error("messaging error: {service}: {reason}")]
    Messaging { service: String, reason: String },

    // ── Recording errors ───────────────────────────────────────
    #[error("recording flush failed: {0}")]
    RecordingFlush(String),

    // ── Persistence errors ─────────────────────────────────────
    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("store error: {0}")]
    Store(String),

    // ── Config errors ──────────────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, LookoutError>;
