//! Mock capture backend for deterministic testing.
//!
//! Counts hardware opens/closes per kind, supports scripted open failures,
//! manual frame/transcript/chunk injection, and hardware-initiated
//! end-of-stream triggering — everything the stream manager, recorder, and
//! scheduler tests need from the hardware seam.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};

use lookout_core::{CaptureChunk, LookoutError, Result, StreamKind, now_ms};

use crate::backend::{CaptureBackend, CaptureSource};

#[derive(Default)]
struct MockState {
    opens: HashMap<StreamKind, usize>,
    failing: HashSet<StreamKind>,
    sources: HashMap<StreamKind, Arc<MockSource>>,
}

/// A capture backend whose hardware is entirely under test control.
pub struct MockBackend {
    state: Mutex<MockState>,
    closes: Arc<Mutex<HashMap<StreamKind, usize>>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState::default()),
            closes: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Make every subsequent `open` for `kind` fail.
    pub fn fail_opens(&self, kind: StreamKind) {
        self.state.lock().unwrap().failing.insert(kind);
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().failing.clear();
    }

    pub fn open_count(&self, kind: StreamKind) -> usize {
        self.state.lock().unwrap().opens.get(&kind).copied().unwrap_or(0)
    }

    pub fn close_count(&self, kind: StreamKind) -> usize {
        self.closes.lock().unwrap().get(&kind).copied().unwrap_or(0)
    }

    /// The most recently opened source for `kind`, for injecting frames,
    /// transcripts, chunks, or an end-of-stream.
    pub fn source(&self, kind: StreamKind) -> Option<Arc<MockSource>> {
        self.state.lock().unwrap().sources.get(&kind).cloned()
    }
}

#[async_trait]
impl CaptureBackend for MockBackend {
    async fn open(&self, kind: StreamKind) -> Result<Arc<dyn CaptureSource>> {
        let mut state = self.state.lock().unwrap();
        if state.failing.contains(&kind) {
            return Err(LookoutError::Acquisition {
                kind,
                reason: "mock open failure".into(),
            });
        }
        *state.opens.entry(kind).or_insert(0) += 1;
        let source = Arc::new(MockSource::new(kind, Arc::clone(&self.closes)));
        state.sources.insert(kind, Arc::clone(&source));
        Ok(source)
    }
}

/// The source half of [`MockBackend`].
pub struct MockSource {
    kind: StreamKind,
    frame: Mutex<Option<Bytes>>,
    transcript: Mutex<String>,
    /// Mimes `supports` answers yes to; empty means "everything".
    supported: Mutex<Vec<String>>,
    chunk_tx: broadcast::Sender<CaptureChunk>,
    closed_tx: watch::Sender<bool>,
    close_calls: AtomicUsize,
    closes: Arc<Mutex<HashMap<StreamKind, usize>>>,
}

impl MockSource {
    fn new(kind: StreamKind, closes: Arc<Mutex<HashMap<StreamKind, usize>>>) -> Self {
        let (chunk_tx, _) = broadcast::channel(256);
        let (closed_tx, _) = watch::channel(false);
        Self {
            kind,
            frame: Mutex::new(Some(Bytes::from_static(b"mock-frame"))),
            transcript: Mutex::new(String::new()),
            supported: Mutex::new(Vec::new()),
            chunk_tx,
            closed_tx,
            close_calls: AtomicUsize::new(0),
            closes,
        }
    }

    pub fn set_frame(&self, data: &[u8]) {
        *self.frame.lock().unwrap() = Some(Bytes::copy_from_slice(data));
    }

    /// Make subsequent `frame` calls fail.
    pub fn clear_frame(&self) {
        *self.frame.lock().unwrap() = None;
    }

    pub fn push_transcript(&self, text: &str) {
        self.transcript.lock().unwrap().push_str(text);
    }

    /// Restrict `supports` to the given mimes.
    pub fn set_supported(&self, mimes: &[&str]) {
        *self.supported.lock().unwrap() = mimes.iter().map(|m| m.to_string()).collect();
    }

    /// Emit an encoded chunk to every subscriber.
    pub fn push_chunk(&self, data: &[u8]) {
        let _ = self.chunk_tx.send(CaptureChunk {
            kind: self.kind,
            data: Bytes::copy_from_slice(data),
            timestamp_ms: now_ms(),
        });
    }

    /// Simulate the hardware ending the stream (permission revoked).
    pub fn end_stream(&self) {
        let _ = self.closed_tx.send(true);
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptureSource for MockSource {
    fn kind(&self) -> StreamKind {
        self.kind
    }

    async fn frame(&self) -> Result<Bytes> {
        if self.kind.is_audio() {
            return Err(LookoutError::UnsupportedCapture {
                kind: self.kind,
                operation: "frames",
            });
        }
        self.frame
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| LookoutError::StreamEnded(self.kind))
    }

    async fn transcript(&self) -> Result<String> {
        if !self.kind.is_audio() {
            return Err(LookoutError::UnsupportedCapture {
                kind: self.kind,
                operation: "transcripts",
            });
        }
        Ok(std::mem::take(&mut *self.transcript.lock().unwrap()))
    }

    fn chunks(&self) -> broadcast::Receiver<CaptureChunk> {
        self.chunk_tx.subscribe()
    }

    fn supports(&self, mime: &str) -> bool {
        let supported = self.supported.lock().unwrap();
        supported.is_empty() || supported.iter().any(|m| m == mime)
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        *self.closes.lock().unwrap().entry(self.kind).or_insert(0) += 1;
        let _ = self.closed_tx.send(true);
    }
}
