//! Mock inference client for deterministic testing.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lookout_core::{LookoutError, Result};

use crate::{InferenceClient, RequestPayload};

/// A recorded request, for assertions.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub server: String,
    pub model: String,
    pub prompt: String,
    pub images: usize,
}

/// Returns queued responses without any HTTP; records every request and
/// tracks how many calls are in flight at once (for overlap assertions).
pub struct MockInferenceClient {
    responses: Mutex<Vec<Result<String>>>,
    pub requests: Arc<Mutex<Vec<RecordedRequest>>>,
    delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockInferenceClient {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(Vec::new()),
            requests: Arc::new(Mutex::new(Vec::new())),
            delay: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Queue a response.
    pub fn with_response(self, text: &str) -> Self {
        self.responses.lock().unwrap().push(Ok(text.to_string()));
        self
    }

    /// Queue an error.
    pub fn with_error(self, message: &str) -> Self {
        self.responses
            .lock()
            .unwrap()
            .push(Err(LookoutError::Inference(message.to_string())));
        self
    }

    /// Make every call take this long (drives scheduler overlap tests).
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock().unwrap() = Some(delay);
        self
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Highest number of concurrently executing calls observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Default for MockInferenceClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InferenceClient for MockInferenceClient {
    async fn send(&self, server: &str, model: &str, payload: &RequestPayload) -> Result<String> {
        self.requests.lock().unwrap().push(RecordedRequest {
            server: server.to_string(),
            model: model.to_string(),
            prompt: payload.prompt.clone(),
            images: payload.images.len(),
        });

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok("(mock: no more queued responses)".to_string())
        } else {
            responses.remove(0)
        }
    }
}
