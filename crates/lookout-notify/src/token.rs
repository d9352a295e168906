use async_trait::async_trait;

use lookout_core::{LookoutError, Result};

/// Supplies the auth token presented to the messaging tools API.
///
/// Tokens are fetched just-in-time for every tool call and never cached
/// across iterations — a revoked token takes effect at the next call.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Result<String>;
}

/// Fixed token from configuration.
pub struct StaticTokenProvider {
    token: Option<String>,
}

impl StaticTokenProvider {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn token(&self) -> Result<String> {
        self.token.clone().ok_or_else(|| LookoutError::Messaging {
            service: "auth".into(),
            reason: "no tools auth token configured".into(),
        })
    }
}
