use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::schema::LookoutConfig;

/// Loads the Lookout configuration and holds it behind a shared lock so
/// long-lived components can reread after `reload()`.
pub struct ConfigLoader {
    config: Arc<RwLock<LookoutConfig>>,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > LOOKOUT_CONFIG env >
    /// ~/.lookout/lookout.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("LOOKOUT_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".lookout")
            .join("lookout.toml")
    }

    /// Load the config from disk, falling back to defaults.
    pub fn load(path: Option<&Path>) -> lookout_core::Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            let raw = std::fs::read_to_string(&config_path)?;
            toml::from_str::<LookoutConfig>(&raw).map_err(|e| {
                lookout_core::LookoutError::Config(format!(
                    "failed to parse {}: {}",
                    config_path.display(),
                    e
                ))
            })?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            LookoutConfig::default()
        };

        let config = Self::apply_env_overrides(config);

        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{}", w);
                }
            }
            Err(e) => {
                return Err(lookout_core::LookoutError::Config(e));
            }
        }

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        })
    }

    /// Get a read snapshot of the current config.
    pub fn get(&self) -> LookoutConfig {
        self.config.read().clone()
    }

    /// Get a shared reference for subscription.
    pub fn shared(&self) -> Arc<RwLock<LookoutConfig>> {
        Arc::clone(&self.config)
    }

    /// Path the config was loaded from.
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Apply env var overrides (LOOKOUT_SERVER_ADDRESS, LOOKOUT_MODEL, …).
    fn apply_env_overrides(mut config: LookoutConfig) -> LookoutConfig {
        if let Ok(v) = std::env::var("LOOKOUT_SERVER_ADDRESS") {
            config.server.address = v;
        }
        if let Ok(v) = std::env::var("LOOKOUT_MODEL") {
            config.server.model = v;
        }
        if let Ok(v) = std::env::var("LOOKOUT_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Ok(v) = std::env::var("LOOKOUT_DATA_DIR") {
            config.storage.data_dir = Some(PathBuf::from(v));
        }
        // Token: config file takes priority, env is the fallback.
        if config.tools.auth_token.is_none() {
            if let Ok(v) = std::env::var("LOOKOUT_TOOLS_TOKEN") {
                config.tools.auth_token = Some(v);
            }
        }
        config
    }

    /// Reload the config from disk.
    pub fn reload(&self) -> lookout_core::Result<()> {
        if !self.config_path.exists() {
            return Err(lookout_core::LookoutError::Config(format!(
                "config file not found: {}",
                self.config_path.display()
            )));
        }
        let raw = std::fs::read_to_string(&self.config_path)?;
        let new_config = toml::from_str::<LookoutConfig>(&raw).map_err(|e| {
            lookout_core::LookoutError::Config(format!(
                "failed to parse {}: {}",
                self.config_path.display(),
                e
            ))
        })?;
        *self.config.write() = Self::apply_env_overrides(new_config);
        info!("configuration reloaded");
        Ok(())
    }
}
