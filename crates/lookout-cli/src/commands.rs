use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use lookout_capture::NullBackend;
use lookout_config::{ConfigLoader, LookoutConfig};
use lookout_runtime::Runtime;
use lookout_store::{AgentStore, SqliteStore};

/// Lookout — sensor-agent runtime
#[derive(Parser)]
#[command(name = "lookout", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to lookout.toml config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (e.g. debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the runtime and the configured agents, until ctrl-c
    Run {
        /// Agent ids to start (defaults to [agents].autostart)
        #[arg(short, long)]
        agent: Vec<String>,
    },
    /// Load the configuration and report problems
    Validate,
    /// List stored agent definitions
    Agents,
}

impl Cli {
    pub async fn run(self) -> lookout_core::Result<()> {
        let loader = ConfigLoader::load(self.config.as_deref())?;
        let config = loader.get();
        init_tracing(&config, self.log_level.as_deref());

        match self.command {
            Commands::Run { agent } => run(config, agent).await,
            Commands::Validate => validate(&config),
            Commands::Agents => list_agents(&config).await,
        }
    }
}

fn init_tracing(config: &LookoutConfig, override_level: Option<&str>) {
    use tracing_subscriber::EnvFilter;

    let level = override_level.unwrap_or(&config.logging.level);
    let filter = EnvFilter::try_from_env("LOOKOUT_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(level));

    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn run(config: LookoutConfig, agents: Vec<String>) -> lookout_core::Result<()> {
    // The capture backend belongs to the host platform (desktop shell,
    // mobile plugin); headless runs get the null backend, so agents that
    // need sensors fail their start visibly instead of hanging.
    let runtime = Runtime::from_config(&config, Arc::new(NullBackend))?;

    let to_start = if agents.is_empty() {
        config.agents.autostart.clone()
    } else {
        agents
    };
    if to_start.is_empty() {
        warn!("no agents to start — pass --agent or set [agents].autostart");
    }
    for id in &to_start {
        if let Err(e) = runtime.start_agent(id).await {
            error!(agent = %id, error = %e, "failed to start agent");
        }
    }

    info!("lookout running — ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    runtime.shutdown().await;
    Ok(())
}

fn validate(config: &LookoutConfig) -> lookout_core::Result<()> {
    match config.validate() {
        Ok(warnings) if warnings.is_empty() => {
            println!("configuration ok");
        }
        Ok(warnings) => {
            println!("configuration ok, {} warning(s):", warnings.len());
            for w in warnings {
                println!("  - {w}");
            }
        }
        Err(e) => {
            println!("configuration invalid: {e}");
            return Err(lookout_core::LookoutError::Config(e));
        }
    }
    Ok(())
}

async fn list_agents(config: &LookoutConfig) -> lookout_core::Result<()> {
    let store = SqliteStore::open(&config.storage.resolved_data_dir().join("agents.db"))?;
    let agents = store.list_agents().await?;
    if agents.is_empty() {
        println!("no agents stored");
        return Ok(());
    }
    for agent in agents {
        println!(
            "{:<24} every {:>4}s  model {:<16} {}",
            agent.id, agent.interval_secs, agent.model, agent.name
        );
    }
    Ok(())
}
