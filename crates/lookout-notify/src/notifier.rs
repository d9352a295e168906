use async_trait::async_trait;
use tracing::info;

use lookout_core::Result;

/// Notification presentation seam. The desktop shell shows real system
/// notifications; headless hosts log them.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, title: &str, body: &str) -> Result<()>;
}

/// Logs notifications instead of displaying them.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, title: &str, body: &str) -> Result<()> {
        info!(title, body, "notification");
        Ok(())
    }
}
