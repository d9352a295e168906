use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use lookout_core::{AgentId, Event, LookoutError, Result};
use lookout_notify::MessageKind;
use lookout_sandbox::HostApi;

use crate::scheduler::{AgentScheduler, Services};

/// The capability table bound for one iteration.
///
/// Captures the issuing agent and iteration id so every tool call is
/// attributable; holds the scheduler so user code can start and stop other
/// agents through the same front door.
pub struct IterationHost {
    scheduler: Arc<AgentScheduler>,
    agent: AgentId,
    iteration: u64,
}

impl IterationHost {
    pub fn new(scheduler: Arc<AgentScheduler>, agent: AgentId, iteration: u64) -> Self {
        Self {
            scheduler,
            agent,
            iteration,
        }
    }

    fn services(&self) -> &Arc<Services> {
        &self.scheduler.services
    }

    /// Memory tools take an explicit target agent id; empty means self.
    fn resolve<'a>(&'a self, target: &'a str) -> &'a str {
        if target.is_empty() { &self.agent } else { target }
    }
}

#[async_trait]
impl HostApi for IterationHost {
    fn agent_id(&self) -> &str {
        &self.agent
    }

    async fn get_memory(&self, target: &str) -> Result<String> {
        let target = self.resolve(target);
        debug!(agent = %self.agent, iteration = self.iteration, target, "tool: get_memory");
        self.services().store.get_memory(target).await
    }

    async fn set_memory(&self, target: &str, value: &str) -> Result<()> {
        let target = self.resolve(target);
        debug!(agent = %self.agent, iteration = self.iteration, target, "tool: set_memory");
        self.services().store.set_memory(target, value).await?;
        self.services().bus.publish(Event::MemoryUpdated {
            agent: target.to_string(),
        });
        Ok(())
    }

    async fn append_memory(&self, target: &str, value: &str, separator: &str) -> Result<()> {
        let target = self.resolve(target);
        debug!(agent = %self.agent, iteration = self.iteration, target, "tool: append_memory");
        self.services()
            .store
            .append_memory(target, value, separator)
            .await?;
        self.services().bus.publish(Event::MemoryUpdated {
            agent: target.to_string(),
        });
        Ok(())
    }

    async fn start_agent(&self, id: &str) -> Result<()> {
        debug!(agent = %self.agent, iteration = self.iteration, target = id, "tool: start_agent");
        self.scheduler.start(id).await
    }

    async fn stop_agent(&self, id: &str) -> Result<()> {
        debug!(agent = %self.agent, iteration = self.iteration, target = id, "tool: stop_agent");
        self.scheduler.stop(id).await;
        Ok(())
    }

    async fn send_message(&self, service: &str, target: &str, body: &str) -> Result<()> {
        let kind = MessageKind::parse(service).ok_or_else(|| LookoutError::Messaging {
            service: service.to_string(),
            reason: "unknown messaging service".into(),
        })?;
        debug!(agent = %self.agent, iteration = self.iteration, service, "tool: send_message");
        // Token is fetched per call and never cached across iterations.
        let token = self.services().tokens.token().await?;
        self.services()
            .messenger
            .send(kind, target, body, &token)
            .await
    }

    async fn notify(&self, title: &str, body: &str) -> Result<()> {
        debug!(agent = %self.agent, iteration = self.iteration, "tool: notify");
        self.services().bus.publish(Event::NotificationRequested {
            title: title.to_string(),
            body: body.to_string(),
        });
        self.services().notifier.notify(title, body).await
    }

    async fn start_clip(&self) -> Result<()> {
        debug!(agent = %self.agent, iteration = self.iteration, "tool: start_clip");
        self.services().recorder.start_clip().await;
        Ok(())
    }

    async fn stop_clip(&self) -> Result<()> {
        debug!(agent = %self.agent, iteration = self.iteration, "tool: stop_clip");
        self.services().recorder.stop_clip().await;
        Ok(())
    }

    async fn mark_clip(&self, label: &str) -> Result<()> {
        debug!(agent = %self.agent, iteration = self.iteration, label, "tool: mark_clip");
        self.services().recorder.add_marker(label).await;
        Ok(())
    }
}
