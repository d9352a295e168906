use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for an agent — a human-readable slug such as
/// `"activity_logger"`, assigned when the agent definition is saved.
pub type AgentId = String;

/// Current timestamp in unix milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// A category of shared hardware capture source.
///
/// Each kind maps to exactly one physical capture handle at a time; the
/// stream manager shares that handle among every agent that needs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    ScreenVideo,
    Camera,
    ScreenAudio,
    Microphone,
    MixedAudio,
}

impl StreamKind {
    pub const ALL: [StreamKind; 5] = [
        StreamKind::ScreenVideo,
        StreamKind::Camera,
        StreamKind::ScreenAudio,
        StreamKind::Microphone,
        StreamKind::MixedAudio,
    ];

    /// Kinds that feed the rolling-buffer recorder.
    pub fn is_recordable(&self) -> bool {
        matches!(self, StreamKind::ScreenVideo | StreamKind::Camera)
    }

    /// Kinds whose capture output is a transcript rather than frames.
    pub fn is_audio(&self) -> bool {
        matches!(
            self,
            StreamKind::ScreenAudio | StreamKind::Microphone | StreamKind::MixedAudio
        )
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StreamKind::ScreenVideo => "screen_video",
            StreamKind::Camera => "camera",
            StreamKind::ScreenAudio => "screen_audio",
            StreamKind::Microphone => "microphone",
            StreamKind::MixedAudio => "mixed_audio",
        };
        f.write_str(s)
    }
}

/// An agent definition — the immutable-per-iteration record the runtime
/// holds a read-only copy of. Owned by the persistence layer; the code
/// payload is loaded separately via `load_code`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub id: AgentId,
    pub name: String,
    /// Prompt template; sensor placeholders (`$SCREEN_OCR`, `$CAMERA`, …)
    /// are expanded by the pipeline each iteration.
    pub prompt: String,
    /// Model identifier passed through to the inference endpoint.
    pub model: String,
    /// Seconds between iteration starts.
    pub interval_secs: u64,
    /// Inference server override; falls back to the configured default.
    #[serde(default)]
    pub server_address: Option<String>,
}

impl AgentDefinition {
    pub fn interval(&self) -> Duration {
        // A zero interval would spin the scheduler; clamp to 1s.
        Duration::from_secs(self.interval_secs.max(1))
    }
}

/// One piece of captured data emitted by a recordable stream.
#[derive(Debug, Clone)]
pub struct CaptureChunk {
    pub kind: StreamKind,
    pub data: Bytes,
    pub timestamp_ms: i64,
}

/// A user-labeled timestamp attached to whatever recording is eventually
/// flushed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marker {
    pub label: String,
    pub timestamp_ms: i64,
}

/// The captured data of one stream kind inside a saved recording.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedTrack {
    pub kind: StreamKind,
    /// Negotiated container/codec mime, e.g. `video/webm;codecs=vp9`.
    pub mime: String,
    #[serde(with = "serde_bytes_base64")]
    pub data: Vec<u8>,
}

/// A committed, durably saved span of captured chunks plus markers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedRecording {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub tracks: Vec<RecordedTrack>,
    pub markers: Vec<Marker>,
}

/// Serialize binary track data as base64 so recording metadata stays
/// readable JSON.
mod serde_bytes_base64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
