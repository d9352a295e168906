//! # lookout-capture
//!
//! The hardware capture seam and the stream resource manager.
//!
//! A small number of expensive, stateful capture handles (screen video,
//! camera, microphone, system audio) are shared across an arbitrary number
//! of concurrently-running agents. The [`StreamManager`] is the single
//! mutual-exclusion point for those handles: N agents requesting the same
//! kind cause exactly one hardware open and exactly one hardware close,
//! bounded by the lifetime of the first acquirer to the last releaser.

pub mod backend;
pub mod manager;
pub mod mock;

pub use backend::{CaptureBackend, CaptureSource, NoopRecognizer, NullBackend, TextRecognizer};
pub use manager::StreamManager;
pub use mock::{MockBackend, MockSource};
