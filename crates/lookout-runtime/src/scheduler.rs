use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use lookout_capture::{StreamManager, TextRecognizer};
use lookout_core::{AgentId, Event, EventBus, LookoutError, Result, StreamKind};
use lookout_infer::InferenceClient;
use lookout_notify::{Messenger, Notifier, TokenProvider};
use lookout_recorder::Recorder;
use lookout_sandbox::{HostApi, ResponseHandler};
use lookout_store::AgentStore;

use crate::host_api::IterationHost;
use crate::pipeline::{IterationContext, Preprocessor, required_kinds};

/// Everything an iteration can touch, wired once at runtime construction.
/// An explicit object instead of process-wide globals, so independent
/// runtime instances can coexist (tests do exactly that).
pub struct Services {
    pub store: Arc<dyn AgentStore>,
    pub streams: Arc<StreamManager>,
    pub recorder: Arc<Recorder>,
    pub infer: Arc<dyn InferenceClient>,
    pub handler: Arc<dyn ResponseHandler>,
    pub ocr: Arc<dyn TextRecognizer>,
    pub messenger: Arc<dyn Messenger>,
    pub notifier: Arc<dyn Notifier>,
    pub tokens: Arc<dyn TokenProvider>,
    pub bus: EventBus,
    /// Inference endpoint used when an agent doesn't carry its own.
    pub default_server: String,
}

/// Book-keeping for one running agent.
struct ScheduleEntry {
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
    /// Server address resolved when the agent started.
    server: String,
    acquired: Vec<StreamKind>,
    iteration: Arc<AtomicU64>,
    task: Option<JoinHandle<()>>,
}

/// Owns the per-agent timer loops.
///
/// State per agent: `Stopped → Starting → Running → Stopped`. `start` is
/// the only operation that surfaces errors — a failed stream acquisition
/// is an unmet precondition; everything that happens inside iterations is
/// logged and terminal to that iteration only.
pub struct AgentScheduler {
    pub(crate) services: Arc<Services>,
    preprocessor: Preprocessor,
    entries: Arc<Mutex<HashMap<AgentId, ScheduleEntry>>>,
}

impl AgentScheduler {
    pub fn new(services: Arc<Services>) -> Arc<Self> {
        let preprocessor = Preprocessor::new(
            Arc::clone(&services.streams),
            Arc::clone(&services.ocr),
            Arc::clone(&services.store),
        );
        Arc::new(Self {
            services,
            preprocessor,
            entries: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Start an agent: acquire every stream its prompt needs (rolling back
    /// on partial failure), then arm the iteration loop. The first
    /// iteration runs immediately; later ones on the fixed interval.
    /// Starting a running agent is a logged no-op.
    pub async fn start(self: &Arc<Self>, id: &str) -> Result<()> {
        let services = &self.services;
        let def = services.store.load_agent(id).await?;

        let running = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();
        let iteration = Arc::new(AtomicU64::new(0));
        let server = def
            .server_address
            .clone()
            .unwrap_or_else(|| services.default_server.clone());

        {
            let mut entries = self.entries.lock().await;
            if entries.contains_key(id) {
                warn!(agent = %id, "agent already running — start ignored");
                return Ok(());
            }
            // Reserve the slot before the (possibly slow) acquisitions so
            // a concurrent start of the same agent can't double-acquire.
            entries.insert(
                id.to_string(),
                ScheduleEntry {
                    running: Arc::clone(&running),
                    cancel: cancel.clone(),
                    server: server.clone(),
                    acquired: Vec::new(),
                    iteration: Arc::clone(&iteration),
                    task: None,
                },
            );
        }

        let mut acquired: Vec<StreamKind> = Vec::new();
        for kind in required_kinds(&def.prompt) {
            match services.streams.acquire(kind, id).await {
                Ok(_) => acquired.push(kind),
                Err(e) => {
                    warn!(agent = %id, %kind, error = %e, "stream acquisition failed — rolling back");
                    for kind in acquired {
                        services.streams.release(kind, id).await;
                    }
                    self.entries.lock().await.remove(id);
                    return Err(e);
                }
            }
        }

        // Streams are live; make sure the rolling buffers are too.
        services.recorder.initialize().await;

        let task = self.spawn_loop(
            id.to_string(),
            def.interval(),
            server,
            acquired.clone(),
            Arc::clone(&running),
            cancel,
            iteration,
        );
        {
            let mut entries = self.entries.lock().await;
            if let Some(entry) = entries.get_mut(id) {
                entry.acquired = acquired;
                entry.task = Some(task);
            }
        }

        services.bus.publish(Event::AgentStarted {
            agent: id.to_string(),
        });
        info!(agent = %id, interval_secs = def.interval_secs, "agent started");
        Ok(())
    }

    /// Stop an agent: cancel the timer and let any in-flight iteration
    /// finish naturally — the loop task then releases the agent's streams
    /// and retires. Stopping a stopped agent is a logged no-op.
    pub async fn stop(&self, id: &str) {
        let entries = self.entries.lock().await;
        let Some(entry) = entries.get(id) else {
            warn!(agent = %id, "stop requested for agent that is not running");
            return;
        };
        if !entry.running.swap(false, Ordering::SeqCst) {
            warn!(agent = %id, "agent is already stopping");
            return;
        }
        entry.cancel.cancel();
        info!(agent = %id, "agent stopping");
    }

    pub async fn is_running(&self, id: &str) -> bool {
        self.entries
            .lock()
            .await
            .get(id)
            .is_some_and(|e| e.running.load(Ordering::SeqCst))
    }

    pub async fn running_agents(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self.entries.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// The server address resolved when the agent started.
    pub async fn server_of(&self, id: &str) -> Option<String> {
        self.entries
            .lock()
            .await
            .get(id)
            .map(|e| e.server.clone())
    }

    /// Stop every agent and wait for their loops (and any in-flight
    /// iterations) to drain.
    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut entries = self.entries.lock().await;
            entries
                .values_mut()
                .filter_map(|entry| {
                    entry.running.store(false, Ordering::SeqCst);
                    entry.cancel.cancel();
                    entry.task.take()
                })
                .collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_loop(
        self: &Arc<Self>,
        agent: AgentId,
        period: std::time::Duration,
        server: String,
        acquired: Vec<StreamKind>,
        running: Arc<AtomicBool>,
        cancel: CancellationToken,
        iteration: Arc<AtomicU64>,
    ) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let services = Arc::clone(&scheduler.services);
            // Re-armed from the fixed period, not chained from completion:
            // iteration duration never shifts the schedule grid. An
            // overrunning iteration simply absorbs the ticks it covered.
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if !running.load(Ordering::SeqCst) {
                            break;
                        }
                        scheduler.run_iteration(&agent, &server, &iteration, &running).await;
                    }
                }
            }

            // Any in-flight iteration has completed naturally by now.
            for kind in &acquired {
                services.streams.release(*kind, &agent).await;
            }
            scheduler.entries.lock().await.remove(&agent);
            services.bus.publish(Event::AgentStopped {
                agent: agent.clone(),
            });
            info!(agent = %agent, "agent stopped");
        })
    }

    /// One scheduled iteration. Never propagates anything to the timer
    /// loop; the recorder's iteration boundary runs exactly once no matter
    /// what happened.
    async fn run_iteration(
        self: &Arc<Self>,
        agent: &str,
        server: &str,
        counter: &AtomicU64,
        running: &AtomicBool,
    ) {
        if !running.load(Ordering::SeqCst) {
            // Covers the race where a stop lands between timer fire and
            // execution.
            debug!(agent, "tick absorbed — agent no longer running");
            return;
        }
        let services = &self.services;
        let iteration = counter.fetch_add(1, Ordering::SeqCst);
        services.bus.publish(Event::IterationStarted {
            agent: agent.to_string(),
            iteration,
        });

        let result = self.iterate(agent, server, iteration).await;
        let ok = result.is_ok();
        match &result {
            Ok(()) => debug!(agent, iteration, "iteration completed"),
            Err(LookoutError::Inference(e)) => {
                warn!(agent, iteration, error = %e, "inference failed — iteration abandoned");
            }
            Err(e) => warn!(agent, iteration, error = %e, "iteration failed"),
        }

        services.recorder.handle_end_of_iteration().await;
        services.bus.publish(Event::IterationFinished {
            agent: agent.to_string(),
            iteration,
            ok,
        });
    }

    async fn iterate(self: &Arc<Self>, agent: &str, server: &str, iteration: u64) -> Result<()> {
        let services = &self.services;
        // Fresh read-only copy per iteration: prompt or model edits take
        // effect at the next tick without a restart.
        let def = services.store.load_agent(agent).await?;

        let payload = self.preprocessor.expand(agent, &def.prompt).await;
        let mut ctx = IterationContext {
            agent: agent.to_string(),
            iteration,
            payload,
            response: None,
        };

        let response = services.infer.send(server, &def.model, &ctx.payload).await?;
        services.bus.publish(Event::IterationOutput {
            agent: agent.to_string(),
            iteration,
            text: response.clone(),
        });
        ctx.response = Some(response);

        let code = services.store.load_code(agent).await?;
        let api: Arc<dyn HostApi> = Arc::new(IterationHost::new(
            Arc::clone(self),
            agent.to_string(),
            iteration,
        ));
        services
            .handler
            .handle(&code, ctx.response.as_deref().unwrap_or_default(), api)
            .await
    }
}
