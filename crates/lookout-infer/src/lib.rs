//! # lookout-infer
//!
//! The inference collaborator. The pipeline hands a fully expanded prompt
//! (plus any attached images) to an [`InferenceClient`]; what travels over
//! the wire is this crate's business.

pub mod http;
pub mod mock;

pub use http::HttpInferenceClient;
pub use mock::MockInferenceClient;

use async_trait::async_trait;

use lookout_core::Result;

/// One inference request: the expanded prompt plus base64-encoded images
/// registered by pre-process placeholders.
#[derive(Debug, Clone, Default)]
pub struct RequestPayload {
    pub prompt: String,
    pub images: Vec<String>,
}

/// Trait implemented by inference transports.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Send one request and return the raw response text. Network errors,
    /// timeouts, and non-2xx statuses all surface as
    /// `LookoutError::Inference`.
    async fn send(&self, server: &str, model: &str, payload: &RequestPayload) -> Result<String>;
}
