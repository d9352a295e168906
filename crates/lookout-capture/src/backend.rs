use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

use lookout_core::{CaptureChunk, LookoutError, Result, StreamKind};

/// The hardware capture collaborator. `open` may prompt the user for
/// permission and can fail or be cancelled; the runtime treats both as an
/// acquisition error.
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    async fn open(&self, kind: StreamKind) -> Result<Arc<dyn CaptureSource>>;
}

/// One live capture handle.
///
/// Video kinds serve still frames via [`frame`](CaptureSource::frame) and
/// continuous encoded chunks via [`chunks`](CaptureSource::chunks); audio
/// kinds serve speech-to-text output via
/// [`transcript`](CaptureSource::transcript) (the ASR engine lives behind
/// this seam and is opaque to the runtime).
#[async_trait]
pub trait CaptureSource: Send + Sync {
    fn kind(&self) -> StreamKind;

    /// Latest still frame (PNG/JPEG bytes). Video kinds only.
    async fn frame(&self) -> Result<Bytes> {
        Err(LookoutError::UnsupportedCapture {
            kind: self.kind(),
            operation: "frames",
        })
    }

    /// Drain the transcript accumulated since the previous call. Audio
    /// kinds only.
    async fn transcript(&self) -> Result<String> {
        Err(LookoutError::UnsupportedCapture {
            kind: self.kind(),
            operation: "transcripts",
        })
    }

    /// Subscribe to the encoded chunk stream. Recordable kinds only;
    /// others return a receiver that never yields.
    fn chunks(&self) -> broadcast::Receiver<CaptureChunk>;

    /// Whether the underlying encoder supports the given container/codec
    /// mime, e.g. `video/webm;codecs=vp9`. Used for codec negotiation.
    fn supports(&self, mime: &str) -> bool;

    /// Becomes `true` when the hardware source ends the stream
    /// unilaterally (e.g. the user revokes screen-share permission).
    fn closed(&self) -> watch::Receiver<bool>;

    /// Release the underlying hardware handle. Called exactly once by the
    /// stream manager.
    async fn close(&self);
}

/// OCR collaborator — an opaque async function from image bytes to text.
#[async_trait]
pub trait TextRecognizer: Send + Sync {
    async fn recognize(&self, image: &[u8]) -> Result<String>;
}

/// A backend for hosts without capture hardware: every open fails, so
/// agents that need sensors report acquisition errors instead of hanging.
pub struct NullBackend;

#[async_trait]
impl CaptureBackend for NullBackend {
    async fn open(&self, kind: StreamKind) -> Result<Arc<dyn CaptureSource>> {
        Err(LookoutError::Acquisition {
            kind,
            reason: "no capture backend available on this host".into(),
        })
    }
}

/// OCR stand-in that recognizes nothing.
pub struct NoopRecognizer;

#[async_trait]
impl TextRecognizer for NoopRecognizer {
    async fn recognize(&self, _image: &[u8]) -> Result<String> {
        Ok(String::new())
    }
}
