use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use lookout_capture::{CaptureSource, StreamManager};
use lookout_core::{
    CaptureChunk, Event, EventBus, Marker, RecordedTrack, SavedRecording, StreamKind, now_ms,
};

use crate::encoder;
use crate::sink::RecordingSink;

/// Recorder states. `Idle` only before `initialize` and after
/// `force_stop`; normal operation cycles `Buffering ⇄ Recording`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Buffering,
    Recording,
}

/// Rolling buffer for one recordable stream kind.
struct TrackBuffer {
    mime: String,
    chunks: Vec<CaptureChunk>,
    collector: Option<JoinHandle<()>>,
    /// False once the underlying stream ended; chunks already collected
    /// are retained for a best-effort flush while `Recording`.
    live: bool,
}

impl TrackBuffer {
    fn stop_collector(&mut self) {
        if let Some(handle) = self.collector.take() {
            handle.abort();
        }
    }
}

struct RecorderInner {
    state: RecorderState,
    tracks: HashMap<StreamKind, TrackBuffer>,
    markers: Vec<Marker>,
}

/// The recording state machine.
///
/// All transitions are serialized behind one async mutex, so concurrent
/// `start_clip`/`stop_clip` calls from agents sharing the buffer are
/// linearized — a `start_clip` arriving mid-`stop_clip` waits for the
/// transition to settle.
pub struct Recorder {
    inner: Arc<Mutex<RecorderInner>>,
    sink: Arc<dyn RecordingSink>,
    streams: Arc<StreamManager>,
    bus: EventBus,
}

impl Recorder {
    pub fn new(
        streams: Arc<StreamManager>,
        sink: Arc<dyn RecordingSink>,
        bus: EventBus,
    ) -> Arc<Self> {
        let recorder = Arc::new(Self {
            inner: Arc::new(Mutex::new(RecorderInner {
                state: RecorderState::Idle,
                tracks: HashMap::new(),
                markers: Vec::new(),
            })),
            sink,
            streams,
            bus: bus.clone(),
        });
        recorder.spawn_stream_listener(bus);
        recorder
    }

    /// Open a rolling-buffer session per currently available recordable
    /// stream and move to `Buffering`. No-op unless `Idle`.
    pub async fn initialize(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state != RecorderState::Idle {
            debug!("recorder already initialized");
            return;
        }
        for kind in StreamKind::ALL.into_iter().filter(StreamKind::is_recordable) {
            if let Some(source) = self.streams.current(kind).await {
                self.open_track(&mut inner, kind, source);
            }
        }
        inner.state = RecorderState::Buffering;
        info!(tracks = inner.tracks.len(), "recorder buffering");
    }

    /// Called once per completed agent iteration. While `Buffering` the
    /// chunk buffers are discarded and restarted so memory never grows
    /// across iterations; a recording in progress spans iterations
    /// untouched.
    pub async fn handle_end_of_iteration(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state != RecorderState::Buffering {
            return;
        }
        inner.tracks.retain(|_, t| t.live);
        for track in inner.tracks.values_mut() {
            track.chunks.clear();
        }
        debug!("rolling buffer restarted");
    }

    /// Promote the rolling buffer to a recording. The chunks already
    /// buffered become the head of the eventual clip (lead-in before the
    /// triggering event). Logged no-op unless `Buffering`.
    pub async fn start_clip(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state != RecorderState::Buffering {
            warn!(state = ?inner.state, "start_clip ignored — recorder is not buffering");
            return;
        }
        inner.state = RecorderState::Recording;
        info!("clip started — rolling buffer promoted to recording head");
    }

    /// Flush the accumulated chunks and pending markers to durable storage
    /// as one saved recording and return to `Buffering`. Logged no-op
    /// unless `Recording`.
    pub async fn stop_clip(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state != RecorderState::Recording {
            warn!(state = ?inner.state, "stop_clip ignored — no clip in progress");
            return;
        }
        self.flush(&mut inner).await;
        inner.state = RecorderState::Buffering;
    }

    /// Shutdown path. Mid-`Recording` is treated as an implicit stop and
    /// flushed best-effort; a plain rolling buffer is discarded unsaved.
    pub async fn force_stop(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            RecorderState::Recording => {
                info!("shutdown mid-recording — flushing clip");
                self.flush(&mut inner).await;
            }
            RecorderState::Buffering => {
                debug!("discarding rolling buffer on shutdown");
            }
            RecorderState::Idle => {}
        }
        for track in inner.tracks.values_mut() {
            track.stop_collector();
        }
        inner.tracks.clear();
        inner.state = RecorderState::Idle;
    }

    /// Append a labeled timestamp to the pending-marker list. Valid in any
    /// state; markers survive until the next successful flush.
    pub async fn add_marker(&self, label: &str) {
        let mut inner = self.inner.lock().await;
        inner.markers.push(Marker {
            label: label.to_string(),
            timestamp_ms: now_ms(),
        });
        debug!(label, pending = inner.markers.len(), "marker added");
    }

    pub async fn state(&self) -> RecorderState {
        self.inner.lock().await.state
    }

    pub async fn pending_markers(&self) -> Vec<Marker> {
        self.inner.lock().await.markers.clone()
    }

    /// Flush everything buffered so far. A failed save is logged and
    /// swallowed — it never blocks the state machine; the data for that
    /// attempt is lost but markers are kept for the next try.
    async fn flush(&self, inner: &mut RecorderInner) {
        let tracks: Vec<RecordedTrack> = inner
            .tracks
            .iter()
            .map(|(kind, t)| RecordedTrack {
                kind: *kind,
                mime: t.mime.clone(),
                data: t.chunks.iter().flat_map(|c| c.data.iter().copied()).collect(),
            })
            .collect();

        let recording = SavedRecording {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            tracks,
            markers: inner.markers.clone(),
        };

        match self.sink.save(recording).await {
            Ok(id) => {
                inner.markers.clear();
                info!(%id, "clip flushed to durable storage");
                self.bus.publish(Event::RecordingSaved { id });
            }
            Err(e) => {
                warn!(error = %e, "recording flush failed — this attempt is lost");
            }
        }

        // Fresh buffer either way; dead tracks are done for good.
        inner.tracks.retain(|_, t| t.live);
        for track in inner.tracks.values_mut() {
            track.chunks.clear();
        }
    }

    fn open_track(
        &self,
        inner: &mut RecorderInner,
        kind: StreamKind,
        source: Arc<dyn CaptureSource>,
    ) {
        let Some(profile) = encoder::negotiate(&*source) else {
            warn!(%kind, "no supported container/codec combination — kind will not be recorded");
            return;
        };
        let collector = spawn_collector(Arc::clone(&self.inner), kind, source.chunks());
        inner.tracks.insert(
            kind,
            TrackBuffer {
                mime: profile.mime.to_string(),
                chunks: Vec::new(),
                collector: Some(collector),
                live: true,
            },
        );
        debug!(%kind, mime = profile.mime, "rolling-buffer track opened");
    }

    /// Watches the stream snapshot events: a recordable stream appearing
    /// while active gets a collector, one disappearing is retired (chunks
    /// retained for best-effort flush while `Recording`).
    fn spawn_stream_listener(self: &Arc<Self>, bus: EventBus) {
        let weak = Arc::downgrade(self);
        let mut events = bus.subscribe();
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(recorder) = weak.upgrade() else { break };
                if let Event::StreamsChanged { active } = event {
                    recorder.sync_tracks(&active).await;
                }
            }
        });
    }

    async fn sync_tracks(&self, active: &[StreamKind]) {
        let mut inner = self.inner.lock().await;
        if inner.state == RecorderState::Idle {
            return;
        }

        // Newly available recordable streams start buffering immediately.
        for kind in active.iter().copied().filter(StreamKind::is_recordable) {
            if !inner.tracks.contains_key(&kind) {
                if let Some(source) = self.streams.current(kind).await {
                    self.open_track(&mut inner, kind, source);
                }
            }
        }

        // Streams that went away: drop outright while buffering, retain
        // collected chunks for best-effort flush while recording.
        let gone: Vec<StreamKind> = inner
            .tracks
            .keys()
            .copied()
            .filter(|k| !active.contains(k))
            .collect();
        for kind in gone {
            if inner.state == RecorderState::Recording {
                if let Some(track) = inner.tracks.get_mut(&kind) {
                    warn!(%kind, "stream ended mid-recording — retaining chunks for flush");
                    track.stop_collector();
                    track.live = false;
                }
            } else if let Some(mut track) = inner.tracks.remove(&kind) {
                debug!(%kind, "stream ended — dropping rolling buffer");
                track.stop_collector();
            }
        }
    }
}

fn spawn_collector(
    inner: Arc<Mutex<RecorderInner>>,
    kind: StreamKind,
    mut rx: broadcast::Receiver<CaptureChunk>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(chunk) => {
                    let mut inner = inner.lock().await;
                    if inner.state == RecorderState::Idle {
                        continue;
                    }
                    if let Some(track) = inner.tracks.get_mut(&kind) {
                        if track.live {
                            track.chunks.push(chunk);
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(%kind, skipped, "chunk collector lagging behind capture");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
