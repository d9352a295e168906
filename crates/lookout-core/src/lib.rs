//! # lookout-core
//!
//! Core types, events, and error types for the Lookout sensor-agent runtime.
//! This crate defines the shared vocabulary used by every other crate in the
//! workspace.

pub mod error;
pub mod event;
pub mod types;

pub use error::{LookoutError, Result};
pub use event::{Event, EventBus};
pub use types::*;
