use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tracing::debug;

use lookout_core::{LookoutError, Result};

/// What kind of message a sandbox tool asked to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Sms,
    Email,
    Whatsapp,
    Call,
    /// Direct POST to a caller-supplied webhook URL (chat integrations).
    Webhook,
}

impl MessageKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sms" => Some(Self::Sms),
            "email" => Some(Self::Email),
            "whatsapp" => Some(Self::Whatsapp),
            "call" => Some(Self::Call),
            "webhook" => Some(Self::Webhook),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sms => "sms",
            Self::Email => "email",
            Self::Whatsapp => "whatsapp",
            Self::Call => "call",
            Self::Webhook => "webhook",
        }
    }
}

/// Messaging seam. The sandbox is responsible only for argument marshaling
/// and supplying the just-in-time auth token; delivery lives here.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send(
        &self,
        kind: MessageKind,
        target: &str,
        body: &str,
        auth_token: &str,
    ) -> Result<()>;
}

/// Client for the hosted messaging tools API.
pub struct HttpMessenger {
    http: reqwest::Client,
    base_url: String,
}

impl HttpMessenger {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder().build().map_err(|e| {
            LookoutError::Messaging {
                service: "http".into(),
                reason: e.to_string(),
            }
        })?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, kind: MessageKind) -> &'static str {
        match kind {
            MessageKind::Sms => "/tools/send-sms",
            MessageKind::Email => "/tools/send-email",
            MessageKind::Whatsapp => "/tools/send-whatsapp",
            MessageKind::Call => "/tools/place-call",
            MessageKind::Webhook => "",
        }
    }
}

#[async_trait]
impl Messenger for HttpMessenger {
    async fn send(
        &self,
        kind: MessageKind,
        target: &str,
        body: &str,
        auth_token: &str,
    ) -> Result<()> {
        let service = kind.as_str();
        let err = |reason: String| LookoutError::Messaging {
            service: service.into(),
            reason,
        };

        let (url, payload) = match kind {
            // Webhooks POST straight to the caller-supplied URL.
            MessageKind::Webhook => (target.to_string(), json!({ "content": body })),
            MessageKind::Email => (
                format!("{}{}", self.base_url, self.endpoint(kind)),
                json!({ "to_email": target, "message": body }),
            ),
            _ => (
                format!("{}{}", self.base_url, self.endpoint(kind)),
                json!({ "to_number": target, "message": body }),
            ),
        };

        debug!(service, %url, "sending message");
        let response = self
            .http
            .post(&url)
            .bearer_auth(auth_token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| err(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(err(format!(
                "{status}: {}",
                detail.chars().take(200).collect::<String>()
            )));
        }
        Ok(())
    }
}

/// A delivered (or rejected) message captured by [`MockMessenger`].
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub kind: MessageKind,
    pub target: String,
    pub body: String,
    pub auth_token: String,
}

/// Records messages instead of delivering them.
#[derive(Default)]
pub struct MockMessenger {
    sent: Mutex<Vec<SentMessage>>,
    failing: Mutex<bool>,
}

impl MockMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Messenger for MockMessenger {
    async fn send(
        &self,
        kind: MessageKind,
        target: &str,
        body: &str,
        auth_token: &str,
    ) -> Result<()> {
        if *self.failing.lock() {
            return Err(LookoutError::Messaging {
                service: kind.as_str().into(),
                reason: "mock delivery failure".into(),
            });
        }
        self.sent.lock().push(SentMessage {
            kind,
            target: target.to_string(),
            body: body.to_string(),
            auth_token: auth_token.to_string(),
        });
        Ok(())
    }
}
