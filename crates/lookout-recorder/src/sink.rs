use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;
use uuid::Uuid;

use lookout_core::{LookoutError, Marker, Result, SavedRecording};

/// Durable storage for saved recordings.
#[async_trait]
pub trait RecordingSink: Send + Sync {
    async fn save(&self, recording: SavedRecording) -> Result<Uuid>;
}

/// Writes each track as a blob file plus a JSON metadata sidecar.
pub struct FsSink {
    dir: PathBuf,
}

#[derive(Serialize)]
struct SidecarTrack<'a> {
    kind: String,
    mime: &'a str,
    file: String,
    bytes: usize,
}

#[derive(Serialize)]
struct Sidecar<'a> {
    id: Uuid,
    created_at: chrono::DateTime<chrono::Utc>,
    markers: &'a [Marker],
    tracks: Vec<SidecarTrack<'a>>,
}

impl FsSink {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

#[async_trait]
impl RecordingSink for FsSink {
    async fn save(&self, recording: SavedRecording) -> Result<Uuid> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| LookoutError::RecordingFlush(e.to_string()))?;

        let mut tracks = Vec::with_capacity(recording.tracks.len());
        for track in &recording.tracks {
            let file = format!("{}.{}.{}", recording.id, track.kind, profile_ext(&track.mime));
            tokio::fs::write(self.dir.join(&file), &track.data)
                .await
                .map_err(|e| LookoutError::RecordingFlush(e.to_string()))?;
            tracks.push(SidecarTrack {
                kind: track.kind.to_string(),
                mime: &track.mime,
                file,
                bytes: track.data.len(),
            });
        }

        let sidecar = Sidecar {
            id: recording.id,
            created_at: recording.created_at,
            markers: &recording.markers,
            tracks,
        };
        let json = serde_json::to_vec_pretty(&sidecar)?;
        tokio::fs::write(self.dir.join(format!("{}.json", recording.id)), json)
            .await
            .map_err(|e| LookoutError::RecordingFlush(e.to_string()))?;

        info!(id = %recording.id, dir = ?self.dir, "recording saved");
        Ok(recording.id)
    }
}

fn profile_ext(mime: &str) -> &'static str {
    if mime.starts_with("video/mp4") {
        "mp4"
    } else if mime.starts_with("video/webm") {
        "webm"
    } else {
        "bin"
    }
}

/// In-memory sink for tests: records every save and can be told to fail.
#[derive(Default)]
pub struct MemorySink {
    saved: Mutex<Vec<SavedRecording>>,
    failing: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn saved(&self) -> Vec<SavedRecording> {
        self.saved.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecordingSink for MemorySink {
    async fn save(&self, recording: SavedRecording) -> Result<Uuid> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(LookoutError::RecordingFlush("mock sink failure".into()));
        }
        let id = recording.id;
        self.saved.lock().unwrap().push(recording);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lookout_core::{RecordedTrack, StreamKind};

    fn recording() -> SavedRecording {
        SavedRecording {
            id: Uuid::new_v4(),
            created_at: chrono::Utc::now(),
            tracks: vec![RecordedTrack {
                kind: StreamKind::ScreenVideo,
                mime: "video/webm;codecs=vp9".into(),
                data: vec![9, 9, 9],
            }],
            markers: vec![Marker {
                label: "hit".into(),
                timestamp_ms: 123,
            }],
        }
    }

    #[tokio::test]
    async fn fs_sink_writes_blob_and_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FsSink::new(dir.path().to_path_buf());
        let rec = recording();
        let id = sink.save(rec).await.unwrap();

        let blob = dir.path().join(format!("{id}.screen_video.webm"));
        assert_eq!(std::fs::read(blob).unwrap(), vec![9, 9, 9]);

        let sidecar = std::fs::read_to_string(dir.path().join(format!("{id}.json"))).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&sidecar).unwrap();
        assert_eq!(parsed["markers"][0]["label"], "hit");
        assert_eq!(parsed["tracks"][0]["bytes"], 3);
    }

    #[tokio::test]
    async fn memory_sink_failure_is_reported() {
        let sink = MemorySink::new();
        sink.set_failing(true);
        assert!(sink.save(recording()).await.is_err());
        assert!(sink.saved().is_empty());
    }
}
