use async_trait::async_trait;
use std::sync::Arc;

use lookout_core::Result;

/// The fixed capability table exposed to user response-handling code.
///
/// One implementation is bound per iteration, capturing the issuing agent's
/// id and iteration counter, so every tool call is correlated back to the
/// iteration that made it. User code reaches nothing except what is listed
/// here.
#[async_trait]
pub trait HostApi: Send + Sync {
    /// The agent this iteration belongs to; memory tools default to it.
    fn agent_id(&self) -> &str;

    // ── Memory ─────────────────────────────────────────────────
    /// Empty `target` means the calling agent itself.
    async fn get_memory(&self, target: &str) -> Result<String>;
    async fn set_memory(&self, target: &str, value: &str) -> Result<()>;
    async fn append_memory(&self, target: &str, value: &str, separator: &str) -> Result<()>;

    // ── Agent control ──────────────────────────────────────────
    async fn start_agent(&self, id: &str) -> Result<()>;
    async fn stop_agent(&self, id: &str) -> Result<()>;

    // ── Messaging / notifications ──────────────────────────────
    /// `service` is one of `sms`, `email`, `whatsapp`, `call`, `webhook`.
    /// The auth token is acquired just-in-time inside the implementation.
    async fn send_message(&self, service: &str, target: &str, body: &str) -> Result<()>;
    async fn notify(&self, title: &str, body: &str) -> Result<()>;

    // ── Clipping ───────────────────────────────────────────────
    async fn start_clip(&self) -> Result<()>;
    async fn stop_clip(&self) -> Result<()>;
    async fn mark_clip(&self, label: &str) -> Result<()>;
}

/// Post-process seam: something that can run an agent's response-handling
/// code. The production implementation is [`crate::WasmSandbox`]; tests
/// inject shortcuts.
#[async_trait]
pub trait ResponseHandler: Send + Sync {
    /// Execute `code` (base64-encoded WASM module) against the raw model
    /// `response` with `api` as the only reachable capability surface.
    ///
    /// Every failure mode — undecodable payload, bad ABI, guest trap, fuel
    /// exhaustion, a tool call that errored — is reported as a
    /// `LookoutError::Sandbox`; nothing propagates further up.
    async fn handle(&self, code: &str, response: &str, api: Arc<dyn HostApi>) -> Result<()>;
}
