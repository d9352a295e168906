use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration — maps to `lookout.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LookoutConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub tools: ToolsConfig,
    pub sandbox: SandboxConfig,
    pub agents: AgentsConfig,
    pub logging: LoggingConfig,
}

// ── Inference server ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Inference endpoint, e.g. "http://127.0.0.1:11434".
    pub address: String,
    /// Default model for agents that don't specify one.
    pub model: String,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:11434".into(),
            model: "gemma3:4b".into(),
            request_timeout_secs: 120,
        }
    }
}

// ── Storage ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory; defaults to ~/.lookout.
    pub data_dir: Option<PathBuf>,
    /// Directory saved recordings are written to; defaults to
    /// `<data_dir>/recordings`.
    pub recordings_dir: Option<PathBuf>,
}

impl StorageConfig {
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".lookout")
        })
    }

    pub fn resolved_recordings_dir(&self) -> PathBuf {
        self.recordings_dir
            .clone()
            .unwrap_or_else(|| self.resolved_data_dir().join("recordings"))
    }
}

// ── Messaging tools API ────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Base URL of the messaging tools API (SMS/email/WhatsApp/call).
    pub base_url: String,
    /// Auth token presented to the tools API. Env fallback:
    /// LOOKOUT_TOOLS_TOKEN.
    pub auth_token: Option<String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.observer-ai.com".into(),
            auth_token: None,
        }
    }
}

// ── Sandbox ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Fuel budget per handler execution (prevents infinite loops).
    pub fuel: u64,
    /// Guest memory cap in MiB. 0 = unlimited.
    pub max_memory_mb: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            fuel: 10_000_000,
            max_memory_mb: 64,
        }
    }
}

// ── Agents ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    /// Agent ids started automatically by `lookout run`.
    pub autostart: Vec<String>,
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default tracing filter (overridden by LOOKOUT_LOG / RUST_LOG).
    pub level: String,
    /// Emit JSON log lines instead of human-readable ones.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

impl LookoutConfig {
    /// Validate the configuration. Returns warnings for suspicious values,
    /// an `Err` for values the runtime cannot start with.
    pub fn validate(&self) -> Result<Vec<String>, String> {
        let mut warnings = Vec::new();

        if self.server.address.is_empty() {
            return Err("server.address is empty".into());
        }
        if !self.server.address.starts_with("http://") && !self.server.address.starts_with("https://")
        {
            warnings.push(format!(
                "server.address '{}' does not look like an http(s) URL",
                self.server.address
            ));
        }
        if self.server.model.is_empty() {
            warnings.push("server.model is empty — agents must set their own model".into());
        }
        if self.sandbox.fuel < 100_000 {
            warnings.push(format!(
                "sandbox.fuel {} is very low — handlers may run out mid-execution",
                self.sandbox.fuel
            ));
        }
        if self.tools.auth_token.is_none() {
            warnings.push(
                "tools.auth_token is unset — messaging tools will fail until one is provided"
                    .into(),
            );
        }

        Ok(warnings)
    }
}
