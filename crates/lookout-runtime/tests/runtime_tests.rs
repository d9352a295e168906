//! End-to-end scheduler and pipeline behavior against mock collaborators.
//!
//! Time-sensitive tests run under a paused clock, so the schedule grid is
//! exact: an agent started at `t0` with interval `T` iterates at
//! `t0, t0+T, t0+2T, …` regardless of how long each iteration takes.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use lookout_capture::{MockBackend, TextRecognizer};
use lookout_core::{AgentDefinition, Event, LookoutError, Result, StreamKind};
use lookout_infer::MockInferenceClient;
use lookout_notify::{MockMessenger, StaticTokenProvider};
use lookout_recorder::MemorySink;
use lookout_runtime::Runtime;
use lookout_sandbox::{HostApi, ResponseHandler};
use lookout_store::{AgentStore, MemStore};

/// Stands in for the WASM sandbox (which has its own suite): dispatches
/// `command: argument` lines from the response to the capability table.
struct ScriptedHandler;

#[async_trait]
impl ResponseHandler for ScriptedHandler {
    async fn handle(&self, _code: &str, response: &str, api: Arc<dyn HostApi>) -> Result<()> {
        for line in response.lines() {
            let line = line.trim();
            if let Some(value) = line.strip_prefix("remember:") {
                api.append_memory("", value.trim(), "\n").await?;
            } else if let Some(label) = line.strip_prefix("mark:") {
                api.mark_clip(label.trim()).await?;
            } else if let Some(id) = line.strip_prefix("start:") {
                api.start_agent(id.trim()).await?;
            } else if let Some(id) = line.strip_prefix("stop:") {
                api.stop_agent(id.trim()).await?;
            } else if let Some(rest) = line.strip_prefix("sms:") {
                let (to, body) = rest.split_once('|').unwrap_or((rest, ""));
                api.send_message("sms", to.trim(), body.trim()).await?;
            } else if line == "start-clip" {
                api.start_clip().await?;
            } else if line == "stop-clip" {
                api.stop_clip().await?;
            } else if line == "stop-self" {
                let id = api.agent_id().to_string();
                api.stop_agent(&id).await?;
            }
        }
        Ok(())
    }
}

struct FixedOcr;

#[async_trait]
impl TextRecognizer for FixedOcr {
    async fn recognize(&self, _image: &[u8]) -> Result<String> {
        Ok("OCR-TEXT".into())
    }
}

struct Fixture {
    runtime: Runtime,
    backend: Arc<MockBackend>,
    infer: Arc<MockInferenceClient>,
    messenger: Arc<MockMessenger>,
    store: Arc<MemStore>,
    sink: Arc<MemorySink>,
}

fn agent(id: &str, prompt: &str, interval_secs: u64) -> AgentDefinition {
    AgentDefinition {
        id: id.into(),
        name: id.into(),
        prompt: prompt.into(),
        model: "test-model".into(),
        interval_secs,
        server_address: None,
    }
}

fn fixture(store: MemStore, infer: MockInferenceClient) -> Fixture {
    let backend = MockBackend::new();
    let store = Arc::new(store);
    let infer = Arc::new(infer);
    let messenger = Arc::new(MockMessenger::new());
    let sink = Arc::new(MemorySink::new());

    let runtime = Runtime::builder()
        .backend(backend.clone())
        .store(store.clone())
        .infer(infer.clone())
        .handler(Arc::new(ScriptedHandler))
        .messenger(messenger.clone())
        .tokens(Arc::new(StaticTokenProvider::new(Some("test-token".into()))))
        .sink(sink.clone())
        .ocr(Arc::new(FixedOcr))
        .default_server("http://mock-server")
        .build()
        .expect("runtime builds");

    Fixture {
        runtime,
        backend,
        infer,
        messenger,
        store,
        sink,
    }
}

async fn await_event(
    rx: &mut broadcast::Receiver<Event>,
    pred: impl Fn(&Event) -> bool,
) -> Event {
    tokio::time::timeout(Duration::from_secs(600), async {
        loop {
            let event = rx.recv().await.expect("event bus open");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event arrived in time")
}

fn stopped(id: &str) -> impl Fn(&Event) -> bool + '_ {
    move |e| matches!(e, Event::AgentStopped { agent } if agent == id)
}

// ── Scheduling ─────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn iterations_fire_on_the_fixed_schedule_grid() {
    let store = MemStore::new().with_agent(agent("ticker", "say hi", 10), "");
    let f = fixture(store, MockInferenceClient::new());
    let mut events = f.runtime.bus().subscribe();

    f.runtime.start_agent("ticker").await.unwrap();
    tokio::time::sleep(Duration::from_secs(35)).await;
    f.runtime.stop_agent("ticker").await;
    await_event(&mut events, stopped("ticker")).await;

    // t0, t0+10, t0+20, t0+30 — and nothing more after the stop.
    assert_eq!(f.infer.request_count(), 4);
}

#[tokio::test(start_paused = true)]
async fn overrunning_iterations_never_overlap_and_absorb_ticks() {
    let store = MemStore::new().with_agent(agent("slow", "say hi", 10), "");
    // Each inference takes 2.5 intervals.
    let infer = MockInferenceClient::new().with_delay(Duration::from_secs(25));
    let f = fixture(store, infer);
    let mut events = f.runtime.bus().subscribe();

    f.runtime.start_agent("slow").await.unwrap();
    tokio::time::sleep(Duration::from_secs(100)).await;
    f.runtime.stop_agent("slow").await;
    await_event(&mut events, stopped("slow")).await;

    // Iterations at t0, t30, t60, t90: the ticks covered by a running
    // iteration are absorbed, the next one fires on the schedule grid.
    assert_eq!(f.infer.request_count(), 4);
    assert_eq!(f.infer.max_in_flight(), 1);
}

#[tokio::test(start_paused = true)]
async fn start_of_running_agent_is_a_noop() {
    let store = MemStore::new().with_agent(agent("solo", "watch $SCREEN_OCR", 3600), "");
    let f = fixture(store, MockInferenceClient::new());

    f.runtime.start_agent("solo").await.unwrap();
    f.runtime.start_agent("solo").await.unwrap();

    assert_eq!(f.backend.open_count(StreamKind::ScreenVideo), 1);
    assert!(f.runtime.scheduler().is_running("solo").await);
}

#[tokio::test(start_paused = true)]
async fn stop_of_stopped_agent_is_a_noop() {
    let store = MemStore::new().with_agent(agent("quiet", "say hi", 3600), "");
    let f = fixture(store, MockInferenceClient::new());
    let mut events = f.runtime.bus().subscribe();

    // Never started at all.
    f.runtime.stop_agent("quiet").await;
    f.runtime.stop_agent("ghost").await;

    f.runtime.start_agent("quiet").await.unwrap();
    f.runtime.stop_agent("quiet").await;
    await_event(&mut events, stopped("quiet")).await;
    f.runtime.stop_agent("quiet").await;
    assert!(!f.runtime.scheduler().is_running("quiet").await);
}

// ── Stream sharing ─────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn shared_stream_survives_first_stop_and_closes_on_last() {
    let store = MemStore::new()
        .with_agent(agent("alpha", "see $SCREEN_OCR", 3600), "")
        .with_agent(agent("beta", "see $SCREEN_OCR too", 3600), "");
    let f = fixture(store, MockInferenceClient::new());
    let mut events = f.runtime.bus().subscribe();

    f.runtime.start_agent("alpha").await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    f.runtime.start_agent("beta").await.unwrap();
    assert_eq!(f.backend.open_count(StreamKind::ScreenVideo), 1);

    f.runtime.stop_agent("alpha").await;
    await_event(&mut events, stopped("alpha")).await;
    // Beta still owns the handle.
    assert_eq!(f.backend.close_count(StreamKind::ScreenVideo), 0);

    f.runtime.stop_agent("beta").await;
    await_event(&mut events, stopped("beta")).await;
    assert_eq!(f.backend.close_count(StreamKind::ScreenVideo), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_acquisition_rolls_back_and_surfaces_from_start() {
    let store = MemStore::new().with_agent(
        agent("needy", "see $SCREEN_OCR hear $MICROPHONE", 3600),
        "",
    );
    let f = fixture(store, MockInferenceClient::new());
    f.backend.fail_opens(StreamKind::Microphone);

    let err = f.runtime.start_agent("needy").await;
    assert!(matches!(
        err,
        Err(LookoutError::Acquisition {
            kind: StreamKind::Microphone,
            ..
        })
    ));

    // The screen stream acquired before the failure was released again.
    assert_eq!(f.backend.open_count(StreamKind::ScreenVideo), 1);
    assert_eq!(f.backend.close_count(StreamKind::ScreenVideo), 1);
    assert!(!f.runtime.scheduler().is_running("needy").await);

    // The fault clears; the same agent starts cleanly.
    f.backend.clear_failures();
    f.runtime.start_agent("needy").await.unwrap();
    assert!(f.runtime.scheduler().is_running("needy").await);
}

// ── Pipeline ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn placeholders_expand_into_the_request_payload() {
    let store = MemStore::new().with_agent(
        agent(
            "watcher",
            "Screen: $SCREEN_OCR | Notes: $MEMORY@notes | $SCREEN_64",
            3600,
        ),
        "",
    );
    let f = fixture(store, MockInferenceClient::new());
    f.store.set_memory("notes", "remembered stuff").await.unwrap();

    let mut events = f.runtime.bus().subscribe();
    f.runtime.start_agent("watcher").await.unwrap();
    await_event(&mut events, |e| {
        matches!(e, Event::IterationFinished { iteration: 0, .. })
    })
    .await;
    f.runtime.stop_agent("watcher").await;
    await_event(&mut events, stopped("watcher")).await;

    let requests = f.infer.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].server, "http://mock-server");
    assert_eq!(requests[0].model, "test-model");
    assert!(requests[0].prompt.contains("Screen: OCR-TEXT"));
    assert!(requests[0].prompt.contains("Notes: remembered stuff"));
    assert!(!requests[0].prompt.contains("$SCREEN_64"));
    // The screen frame rides along as an attached image.
    assert_eq!(requests[0].images, 1);
}

#[tokio::test(start_paused = true)]
async fn dead_stream_degrades_to_inline_error_marker() {
    let store = MemStore::new().with_agent(agent("camwatch", "cam: $CAMERA", 10), "");
    let f = fixture(store, MockInferenceClient::new());
    let mut events = f.runtime.bus().subscribe();

    f.runtime.start_agent("camwatch").await.unwrap();
    await_event(&mut events, |e| {
        matches!(e, Event::IterationFinished { iteration: 0, .. })
    })
    .await;

    // The camera dies between iterations (permission revoked).
    f.backend.source(StreamKind::Camera).unwrap().end_stream();
    tokio::time::sleep(Duration::from_secs(15)).await;
    f.runtime.stop_agent("camwatch").await;
    await_event(&mut events, stopped("camwatch")).await;

    let requests = f.infer.requests.lock().unwrap();
    assert_eq!(requests[0].images, 1);
    assert!(requests[1].prompt.contains("[camera image unavailable]"));
    assert_eq!(requests[1].images, 0);
}

#[tokio::test(start_paused = true)]
async fn inference_failure_ends_iteration_but_not_the_loop() {
    let store = MemStore::new().with_agent(agent("flaky", "say hi", 10), "");
    let infer = MockInferenceClient::new()
        .with_error("HTTP 502: bad gateway")
        .with_response("remember: recovered");
    let f = fixture(store, infer);
    let mut events = f.runtime.bus().subscribe();

    f.runtime.start_agent("flaky").await.unwrap();

    let first = await_event(&mut events, |e| {
        matches!(e, Event::IterationFinished { iteration: 0, .. })
    })
    .await;
    assert!(matches!(first, Event::IterationFinished { ok: false, .. }));

    let second = await_event(&mut events, |e| {
        matches!(e, Event::IterationFinished { iteration: 1, .. })
    })
    .await;
    assert!(matches!(second, Event::IterationFinished { ok: true, .. }));

    f.runtime.stop_agent("flaky").await;
    await_event(&mut events, stopped("flaky")).await;
    assert_eq!(f.store.get_memory("flaky").await.unwrap(), "recovered");
}

// ── Sandbox tools through the host ─────────────────────────────

#[tokio::test(start_paused = true)]
async fn memory_appends_are_ordered_within_one_agent() {
    let store = MemStore::new().with_agent(agent("memo", "say hi", 10), "");
    let infer = MockInferenceClient::new()
        .with_response("remember: one")
        .with_response("remember: two");
    let f = fixture(store, infer);
    let mut events = f.runtime.bus().subscribe();

    f.runtime.start_agent("memo").await.unwrap();
    tokio::time::sleep(Duration::from_secs(15)).await;
    f.runtime.stop_agent("memo").await;
    await_event(&mut events, stopped("memo")).await;

    assert_eq!(f.store.get_memory("memo").await.unwrap(), "one\ntwo");
}

#[tokio::test(start_paused = true)]
async fn clip_tools_drive_the_recorder_through_iterations() {
    let store = MemStore::new().with_agent(agent("clipper", "watch $SCREEN_OCR", 10), "");
    let infer = MockInferenceClient::new()
        .with_response("start-clip\nmark: hit")
        .with_response("stop-clip");
    let f = fixture(store, infer);
    let mut events = f.runtime.bus().subscribe();

    f.runtime.start_agent("clipper").await.unwrap();
    tokio::time::sleep(Duration::from_secs(15)).await;
    f.runtime.stop_agent("clipper").await;
    await_event(&mut events, stopped("clipper")).await;

    let saved = f.sink.saved();
    assert_eq!(saved.len(), 1);
    let labels: Vec<_> = saved[0].markers.iter().map(|m| m.label.as_str()).collect();
    assert_eq!(labels, vec!["hit"]);
}

#[tokio::test(start_paused = true)]
async fn messaging_tool_carries_the_fresh_auth_token() {
    let store = MemStore::new().with_agent(agent("pager", "say hi", 3600), "");
    let infer = MockInferenceClient::new().with_response("sms: +15551234567|screen changed");
    let f = fixture(store, infer);
    let mut events = f.runtime.bus().subscribe();

    f.runtime.start_agent("pager").await.unwrap();
    await_event(&mut events, |e| {
        matches!(e, Event::IterationFinished { iteration: 0, .. })
    })
    .await;
    f.runtime.stop_agent("pager").await;
    await_event(&mut events, stopped("pager")).await;

    let sent = f.messenger.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].target, "+15551234567");
    assert_eq!(sent[0].body, "screen changed");
    assert_eq!(sent[0].auth_token, "test-token");
}

#[tokio::test(start_paused = true)]
async fn agent_can_stop_itself_from_its_own_handler() {
    let store = MemStore::new().with_agent(agent("oneshot", "say hi", 10), "");
    let infer = MockInferenceClient::new().with_response("stop-self");
    let f = fixture(store, infer);
    let mut events = f.runtime.bus().subscribe();

    f.runtime.start_agent("oneshot").await.unwrap();
    await_event(&mut events, stopped("oneshot")).await;

    assert!(!f.runtime.scheduler().is_running("oneshot").await);
    assert_eq!(f.infer.request_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn agent_can_start_another_agent() {
    let store = MemStore::new()
        .with_agent(agent("manager", "say hi", 3600), "")
        .with_agent(agent("worker", "work work", 3600), "");
    let infer = MockInferenceClient::new().with_response("start: worker");
    let f = fixture(store, infer);
    let mut events = f.runtime.bus().subscribe();

    f.runtime.start_agent("manager").await.unwrap();
    await_event(&mut events, |e| {
        matches!(e, Event::AgentStarted { agent } if agent == "worker")
    })
    .await;
    assert!(f.runtime.scheduler().is_running("worker").await);

    f.runtime.shutdown().await;
    assert!(!f.runtime.scheduler().is_running("worker").await);
    assert!(!f.runtime.scheduler().is_running("manager").await);
}
