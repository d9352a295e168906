//! # lookout-config
//!
//! Configuration for the Lookout runtime (`lookout.toml`): schema,
//! defaults, env-var overrides, and validation.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::LookoutConfig;
