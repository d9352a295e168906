use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use regex::{NoExpand, Regex};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock};
use tracing::warn;

use lookout_capture::{StreamManager, TextRecognizer};
use lookout_core::{AgentId, LookoutError, Result, StreamKind};
use lookout_infer::RequestPayload;
use lookout_store::AgentStore;

/// Transient per-iteration state: the expanded prompt, attached images,
/// the raw model response, and the iteration id that correlates
/// asynchronous tool calls back to the iteration that issued them.
#[derive(Debug)]
pub struct IterationContext {
    pub agent: AgentId,
    pub iteration: u64,
    pub payload: RequestPayload,
    pub response: Option<String>,
}

static SCREEN_OCR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\$SCREEN_OCR\b").unwrap());
static SCREEN_64: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\$SCREEN_64\b").unwrap());
static CAMERA: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\$CAMERA\b").unwrap());
static MICROPHONE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\$MICROPHONE\b").unwrap());
static SCREEN_AUDIO: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\$SCREEN_AUDIO\b").unwrap());
static ALL_AUDIO: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\$ALL_AUDIO\b").unwrap());
static MEMORY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$MEMORY(?:@([A-Za-z0-9_\-]+))?").unwrap());

/// The stream kinds a prompt template needs, in acquisition order.
/// `$MEMORY` needs no stream.
pub fn required_kinds(template: &str) -> Vec<StreamKind> {
    let mut kinds = Vec::new();
    let mut push = |kind: StreamKind| {
        if !kinds.contains(&kind) {
            kinds.push(kind);
        }
    };
    if SCREEN_OCR.is_match(template) || SCREEN_64.is_match(template) {
        push(StreamKind::ScreenVideo);
    }
    if CAMERA.is_match(template) {
        push(StreamKind::Camera);
    }
    if MICROPHONE.is_match(template) {
        push(StreamKind::Microphone);
    }
    if SCREEN_AUDIO.is_match(template) {
        push(StreamKind::ScreenAudio);
    }
    if ALL_AUDIO.is_match(template) {
        push(StreamKind::MixedAudio);
    }
    kinds
}

/// Expands sensor placeholders into a concrete request payload.
///
/// Handlers are independent and order-agnostic: each one only touches its
/// own token, and a failing handler degrades to an inline error marker
/// instead of aborting the iteration.
pub struct Preprocessor {
    streams: Arc<StreamManager>,
    ocr: Arc<dyn TextRecognizer>,
    store: Arc<dyn AgentStore>,
}

impl Preprocessor {
    pub fn new(
        streams: Arc<StreamManager>,
        ocr: Arc<dyn TextRecognizer>,
        store: Arc<dyn AgentStore>,
    ) -> Self {
        Self {
            streams,
            ocr,
            store,
        }
    }

    pub async fn expand(&self, agent: &str, template: &str) -> RequestPayload {
        let mut prompt = template.to_string();
        let mut images = Vec::new();

        if SCREEN_OCR.is_match(&prompt) {
            let text = match self.screen_text().await {
                Ok(text) => text,
                Err(e) => {
                    warn!(agent, error = %e, "screen OCR placeholder failed");
                    "[screen text unavailable]".into()
                }
            };
            prompt = SCREEN_OCR.replace_all(&prompt, NoExpand(&text)).into_owned();
        }

        if SCREEN_64.is_match(&prompt) {
            match self.frame_b64(StreamKind::ScreenVideo).await {
                Ok(b64) => {
                    images.push(b64);
                    prompt = SCREEN_64.replace_all(&prompt, NoExpand("")).into_owned();
                }
                Err(e) => {
                    warn!(agent, error = %e, "screen image placeholder failed");
                    prompt = SCREEN_64
                        .replace_all(&prompt, NoExpand("[screen image unavailable]"))
                        .into_owned();
                }
            }
        }

        if CAMERA.is_match(&prompt) {
            match self.frame_b64(StreamKind::Camera).await {
                Ok(b64) => {
                    images.push(b64);
                    prompt = CAMERA.replace_all(&prompt, NoExpand("")).into_owned();
                }
                Err(e) => {
                    warn!(agent, error = %e, "camera placeholder failed");
                    prompt = CAMERA
                        .replace_all(&prompt, NoExpand("[camera image unavailable]"))
                        .into_owned();
                }
            }
        }

        for (re, kind, marker) in [
            (
                &*MICROPHONE,
                StreamKind::Microphone,
                "[microphone transcript unavailable]",
            ),
            (
                &*SCREEN_AUDIO,
                StreamKind::ScreenAudio,
                "[system audio transcript unavailable]",
            ),
            (
                &*ALL_AUDIO,
                StreamKind::MixedAudio,
                "[audio transcript unavailable]",
            ),
        ] {
            if !re.is_match(&prompt) {
                continue;
            }
            let text = match self.transcript(kind).await {
                Ok(text) => text,
                Err(e) => {
                    warn!(agent, %kind, error = %e, "transcript placeholder failed");
                    marker.into()
                }
            };
            prompt = re.replace_all(&prompt, NoExpand(&text)).into_owned();
        }

        if MEMORY.is_match(&prompt) {
            // One lookup per distinct target; `$MEMORY` without a suffix
            // targets the calling agent.
            let targets: HashSet<Option<String>> = MEMORY
                .captures_iter(&prompt)
                .map(|c| c.get(1).map(|m| m.as_str().to_string()))
                .collect();
            let mut values: HashMap<Option<String>, String> = HashMap::new();
            for key in targets {
                let target = key.clone().unwrap_or_else(|| agent.to_string());
                let value = match self.store.get_memory(&target).await {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(agent, target = %target, error = %e, "memory placeholder failed");
                        "[memory unavailable]".into()
                    }
                };
                values.insert(key, value);
            }
            prompt = MEMORY
                .replace_all(&prompt, |caps: &regex::Captures<'_>| {
                    let key = caps.get(1).map(|m| m.as_str().to_string());
                    values.get(&key).cloned().unwrap_or_default()
                })
                .into_owned();
        }

        RequestPayload { prompt, images }
    }

    async fn source(&self, kind: StreamKind) -> Result<Arc<dyn lookout_capture::CaptureSource>> {
        self.streams
            .current(kind)
            .await
            .ok_or(LookoutError::StreamEnded(kind))
    }

    async fn screen_text(&self) -> Result<String> {
        let source = self.source(StreamKind::ScreenVideo).await?;
        let frame = source.frame().await?;
        self.ocr.recognize(&frame).await
    }

    async fn frame_b64(&self, kind: StreamKind) -> Result<String> {
        let source = self.source(kind).await?;
        let frame = source.frame().await?;
        Ok(BASE64.encode(&frame))
    }

    async fn transcript(&self, kind: StreamKind) -> Result<String> {
        let source = self.source(kind).await?;
        source.transcript().await
    }
}
