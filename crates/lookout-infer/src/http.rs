use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

use lookout_core::{LookoutError, Result};

use crate::{InferenceClient, RequestPayload};

/// OpenAI-compatible chat-completions client (Ollama, llama.cpp server,
/// and hosted proxies all speak this shape).
pub struct HttpInferenceClient {
    http: reqwest::Client,
}

impl HttpInferenceClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LookoutError::Inference(format!("failed to build http client: {e}")))?;
        Ok(Self { http })
    }

    fn build_body(model: &str, payload: &RequestPayload) -> Value {
        let mut content = vec![json!({ "type": "text", "text": payload.prompt })];
        for image in &payload.images {
            content.push(json!({
                "type": "image_url",
                "image_url": { "url": format!("data:image/png;base64,{image}") }
            }));
        }
        json!({
            "model": model,
            "messages": [{ "role": "user", "content": content }],
            "stream": false,
        })
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn send(&self, server: &str, model: &str, payload: &RequestPayload) -> Result<String> {
        let url = format!("{}/v1/chat/completions", server.trim_end_matches('/'));
        debug!(%url, model, images = payload.images.len(), "sending inference request");

        let response = self
            .http
            .post(&url)
            .json(&Self::build_body(model, payload))
            .send()
            .await
            .map_err(|e| LookoutError::Inference(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LookoutError::Inference(format!(
                "{url} returned {status}: {}",
                body.chars().take(300).collect::<String>()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| LookoutError::Inference(format!("invalid response body: {e}")))?;

        body["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| {
                LookoutError::Inference("response missing choices[0].message.content".into())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_includes_images_as_data_urls() {
        let payload = RequestPayload {
            prompt: "what is on screen?".into(),
            images: vec!["QUJD".into()],
        };
        let body = HttpInferenceClient::build_body("gemma3:4b", &payload);
        assert_eq!(body["model"], "gemma3:4b");
        assert_eq!(body["messages"][0]["content"][0]["text"], "what is on screen?");
        assert_eq!(
            body["messages"][0]["content"][1]["image_url"]["url"],
            "data:image/png;base64,QUJD"
        );
    }
}
