use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use lookout_capture::{CaptureBackend, NoopRecognizer, StreamManager, TextRecognizer};
use lookout_config::LookoutConfig;
use lookout_core::{Event, EventBus, LookoutError, Result};
use lookout_infer::{HttpInferenceClient, InferenceClient};
use lookout_notify::{
    HttpMessenger, LogNotifier, Messenger, Notifier, StaticTokenProvider, TokenProvider,
};
use lookout_recorder::{FsSink, Recorder, RecordingSink};
use lookout_sandbox::{ResponseHandler, WasmSandbox};
use lookout_store::{AgentStore, SqliteStore};

use crate::scheduler::{AgentScheduler, Services};

/// The application root: owns the event bus, stream manager, recorder, and
/// scheduler, with an explicit construction/teardown lifecycle. Build one
/// per process — or several, in tests; nothing here is global.
pub struct Runtime {
    services: Arc<Services>,
    scheduler: Arc<AgentScheduler>,
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    /// Wire the production collaborators from configuration: SQLite store,
    /// HTTP inference, filesystem recording sink, WASM sandbox. The
    /// capture backend stays caller-supplied — it is owned by the host
    /// platform.
    pub fn from_config(config: &LookoutConfig, backend: Arc<dyn CaptureBackend>) -> Result<Self> {
        let data_dir = config.storage.resolved_data_dir();
        std::fs::create_dir_all(&data_dir)?;

        let store = SqliteStore::open(&data_dir.join("agents.db"))?;
        let infer = HttpInferenceClient::new(Duration::from_secs(
            config.server.request_timeout_secs,
        ))?;
        let handler = WasmSandbox::new(config.sandbox.fuel, config.sandbox.max_memory_mb)?;
        let messenger = HttpMessenger::new(&config.tools.base_url)?;
        let tokens = StaticTokenProvider::new(config.tools.auth_token.clone());
        let sink = FsSink::new(config.storage.resolved_recordings_dir());

        Self::builder()
            .backend(backend)
            .store(Arc::new(store))
            .infer(Arc::new(infer))
            .handler(Arc::new(handler))
            .messenger(Arc::new(messenger))
            .tokens(Arc::new(tokens))
            .sink(Arc::new(sink))
            .default_server(&config.server.address)
            .build()
    }

    pub fn scheduler(&self) -> &Arc<AgentScheduler> {
        &self.scheduler
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub fn bus(&self) -> &EventBus {
        &self.services.bus
    }

    pub async fn start_agent(&self, id: &str) -> Result<()> {
        self.scheduler.start(id).await
    }

    pub async fn stop_agent(&self, id: &str) {
        self.scheduler.stop(id).await;
    }

    /// Stop every agent, drain in-flight iterations, and retire the
    /// recorder (flushing a clip in progress).
    pub async fn shutdown(&self) {
        info!("runtime shutting down");
        self.scheduler.shutdown().await;
        self.services.recorder.force_stop().await;
        self.services.bus.publish(Event::Shutdown);
    }
}

/// Assembles a [`Runtime`] from collaborator implementations.
#[derive(Default)]
pub struct RuntimeBuilder {
    backend: Option<Arc<dyn CaptureBackend>>,
    store: Option<Arc<dyn AgentStore>>,
    infer: Option<Arc<dyn InferenceClient>>,
    handler: Option<Arc<dyn ResponseHandler>>,
    messenger: Option<Arc<dyn Messenger>>,
    tokens: Option<Arc<dyn TokenProvider>>,
    sink: Option<Arc<dyn RecordingSink>>,
    ocr: Option<Arc<dyn TextRecognizer>>,
    notifier: Option<Arc<dyn Notifier>>,
    bus: Option<EventBus>,
    default_server: Option<String>,
}

impl RuntimeBuilder {
    pub fn backend(mut self, backend: Arc<dyn CaptureBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn store(mut self, store: Arc<dyn AgentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn infer(mut self, infer: Arc<dyn InferenceClient>) -> Self {
        self.infer = Some(infer);
        self
    }

    pub fn handler(mut self, handler: Arc<dyn ResponseHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn messenger(mut self, messenger: Arc<dyn Messenger>) -> Self {
        self.messenger = Some(messenger);
        self
    }

    pub fn tokens(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn RecordingSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn ocr(mut self, ocr: Arc<dyn TextRecognizer>) -> Self {
        self.ocr = Some(ocr);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn default_server(mut self, server: &str) -> Self {
        self.default_server = Some(server.to_string());
        self
    }

    pub fn build(self) -> Result<Runtime> {
        fn missing(what: &str) -> LookoutError {
            LookoutError::Config(format!("runtime builder is missing {what}"))
        }

        let bus = self.bus.unwrap_or_default();
        let backend = self.backend.ok_or_else(|| missing("a capture backend"))?;
        let streams = StreamManager::new(backend, bus.clone());
        let sink = self.sink.ok_or_else(|| missing("a recording sink"))?;
        let recorder = Recorder::new(Arc::clone(&streams), sink, bus.clone());

        let services = Arc::new(Services {
            store: self.store.ok_or_else(|| missing("an agent store"))?,
            streams,
            recorder,
            infer: self.infer.ok_or_else(|| missing("an inference client"))?,
            handler: self.handler.ok_or_else(|| missing("a response handler"))?,
            ocr: self.ocr.unwrap_or_else(|| Arc::new(NoopRecognizer)),
            messenger: self.messenger.ok_or_else(|| missing("a messenger"))?,
            notifier: self.notifier.unwrap_or_else(|| Arc::new(LogNotifier)),
            tokens: self.tokens.ok_or_else(|| missing("a token provider"))?,
            bus,
            default_server: self
                .default_server
                .unwrap_or_else(|| "http://127.0.0.1:11434".to_string()),
        });

        Ok(Runtime {
            scheduler: AgentScheduler::new(Arc::clone(&services)),
            services,
        })
    }
}
