//! # lookout-recorder
//!
//! The recording state machine: a rolling buffer of recent capture data per
//! recordable stream, promoted to a durably saved clip on command.
//!
//! ```text
//!   Idle ──initialize──▶ Buffering ──start_clip──▶ Recording
//!                           ▲                          │
//!                           └───────stop_clip──────────┘
//! ```
//!
//! While `Buffering`, the chunk buffer is discarded and restarted at every
//! agent iteration boundary, so memory stays bounded. `start_clip` promotes
//! whatever is already buffered to the head of the eventual clip — the saved
//! recording always includes a few seconds of lead-in before the triggering
//! event.

pub mod encoder;
pub mod session;
pub mod sink;

pub use encoder::EncodingProfile;
pub use session::{Recorder, RecorderState};
pub use sink::{FsSink, MemorySink, RecordingSink};
