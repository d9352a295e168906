//! # lookout-runtime
//!
//! The agent runtime — per-agent timer loops driving a structured
//! pre-process → infer → post-process pipeline over shared capture streams.
//!
//! ## Architecture
//!
//! ```text
//!            ┌────────────────┐
//!            │ AgentScheduler │  one timer loop per running agent
//!            └───────┬────────┘
//!                    │ tick (fixed period, overruns absorbed)
//!                    ▼
//!            ┌────────────────┐
//!            │  RunIteration  │
//!            │                │
//!            │  1. Expand     │  ← placeholders: streams, OCR, memory
//!            │  2. Infer      │  ← HTTP chat completion
//!            │  3. Handle     │  ← user code in the capability sandbox
//!            └───────┬────────┘
//!                    │ always, exactly once
//!                    ▼
//!        Recorder::handle_end_of_iteration
//! ```
//!
//! Iterations of different agents overlap freely; iterations of the same
//! agent never do — a tick landing while the previous iteration is still
//! in flight is absorbed, and the next one fires on the original schedule
//! grid, so iteration duration cannot accumulate drift.

pub mod host_api;
pub mod pipeline;
pub mod runtime;
pub mod scheduler;

pub use pipeline::{IterationContext, Preprocessor, required_kinds};
pub use runtime::{Runtime, RuntimeBuilder};
pub use scheduler::{AgentScheduler, Services};
