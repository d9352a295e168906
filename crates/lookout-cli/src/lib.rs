//! # lookout-cli
//!
//! Command-line interface for the Lookout agent runtime.
//!
//! ## Commands
//!
//! - `lookout run` — start the runtime and the configured agents
//! - `lookout validate` — load and validate the configuration
//! - `lookout agents` — list stored agent definitions

pub mod commands;

pub use commands::Cli;
