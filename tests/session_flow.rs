//! End-to-end call flows against in-memory audio devices and a scripted
//! live connection.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use salesboss::audio::pcm::encode_pcm16;
use salesboss::audio::{AudioBuffer, AudioError, AudioHost, InputDevice, LevelTap, SampleCallback};
use salesboss::effects::{SessionConfig, SessionEffectRunner};
use salesboss::live::{ClientMessage, LiveConnector, LiveLink, ServerMessage, TransportError, TransportEvent};
use salesboss::metrics::MetricsCollector;
use salesboss::playback::{OutputContext, UnitId};
use salesboss::state_machine::Event;
use salesboss::tools::{ProductDisplay, ProductRecommendation};
use salesboss::{CallController, CallStatus, Frontend, StateLoopHandle, UiState};

// ---------------------------------------------------------------------------
// Fake audio host
// ---------------------------------------------------------------------------

#[derive(Default)]
struct InputLog {
    callback: Option<SampleCallback>,
    starts: usize,
    stops: usize,
}

struct FakeInput {
    log: Arc<Mutex<InputLog>>,
    start_delay: Duration,
    refuse_start: bool,
}

impl InputDevice for FakeInput {
    fn sample_rate(&self) -> u32 {
        16_000
    }

    fn channels(&self) -> u16 {
        1
    }

    fn start(&mut self, on_samples: SampleCallback) -> Result<(), AudioError> {
        // A slow driver blocks the caller just like a real device open
        std::thread::sleep(self.start_delay);
        if self.refuse_start {
            return Err(AudioError::StreamFailed("device busy".into()));
        }
        let mut log = self.log.lock().unwrap();
        log.callback = Some(on_samples);
        log.starts += 1;
        Ok(())
    }

    fn stop(&mut self) {
        let mut log = self.log.lock().unwrap();
        if log.callback.take().is_some() {
            log.stops += 1;
        }
    }
}

#[derive(Default)]
struct OutputLog {
    started: Vec<(UnitId, f64, f64)>,
    stopped: Vec<UnitId>,
    closed: usize,
}

struct FakeOutput(Arc<Mutex<OutputLog>>);

impl OutputContext for FakeOutput {
    fn current_time(&self) -> f64 {
        0.0
    }

    fn start_at(&mut self, id: UnitId, buffer: &AudioBuffer, when: f64) {
        self.0
            .lock()
            .unwrap()
            .started
            .push((id, when, buffer.duration()));
    }

    fn stop(&mut self, id: UnitId) {
        self.0.lock().unwrap().stopped.push(id);
    }

    fn take_finished(&mut self) -> Vec<UnitId> {
        Vec::new()
    }

    fn close(&mut self) {
        self.0.lock().unwrap().closed += 1;
    }
}

#[derive(Default)]
struct FakeHost {
    input: Arc<Mutex<InputLog>>,
    output: Arc<Mutex<OutputLog>>,
    start_delay: Duration,
    refuse_start: bool,
}

impl FakeHost {
    fn starts(&self) -> usize {
        self.input.lock().unwrap().starts
    }

    fn stops(&self) -> usize {
        self.input.lock().unwrap().stops
    }

    /// Feed samples through the running capture callback, if any
    fn speak(&self, samples: &[f32]) {
        let mut log = self.input.lock().unwrap();
        if let Some(callback) = log.callback.as_mut() {
            callback(samples);
        }
    }
}

impl AudioHost for FakeHost {
    fn open_input(&self, _device: Option<&str>) -> Result<Box<dyn InputDevice>, AudioError> {
        Ok(Box::new(FakeInput {
            log: self.input.clone(),
            start_delay: self.start_delay,
            refuse_start: self.refuse_start,
        }))
    }

    fn open_output(
        &self,
        _device: Option<&str>,
        _tap: Option<LevelTap>,
    ) -> Result<Box<dyn OutputContext>, AudioError> {
        Ok(Box::new(FakeOutput(self.output.clone())))
    }
}

// ---------------------------------------------------------------------------
// Scripted connector
// ---------------------------------------------------------------------------

struct ScriptedLink {
    setup: ClientMessage,
    events: mpsc::Sender<TransportEvent>,
    outbound: mpsc::UnboundedReceiver<ClientMessage>,
}

#[derive(Default)]
struct ScriptedConnector {
    links: Mutex<Vec<ScriptedLink>>,
}

impl LiveConnector for ScriptedConnector {
    fn connect(&self, setup: ClientMessage) -> BoxFuture<'static, Result<LiveLink, TransportError>> {
        let (events_tx, events_rx) = mpsc::channel(64);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        self.links.lock().unwrap().push(ScriptedLink {
            setup,
            events: events_tx,
            outbound: outbound_rx,
        });
        Box::pin(async move {
            Ok(LiveLink {
                outbound: outbound_tx,
                events: events_rx,
                tasks: Vec::new(),
            })
        })
    }
}

impl ScriptedConnector {
    fn count(&self) -> usize {
        self.links.lock().unwrap().len()
    }

    fn events(&self, index: usize) -> mpsc::Sender<TransportEvent> {
        self.links.lock().unwrap()[index].events.clone()
    }

    /// Drain what the session has sent so far on link `index`
    fn drain(&self, index: usize) -> Vec<ClientMessage> {
        let mut links = self.links.lock().unwrap();
        let mut out = Vec::new();
        while let Ok(msg) = links[index].outbound.try_recv() {
            out.push(msg);
        }
        out
    }

    /// Whether every sender of link `index`'s outbound queue is gone
    fn outbound_closed(&self, index: usize) -> bool {
        let mut links = self.links.lock().unwrap();
        matches!(
            links[index].outbound.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        )
    }
}

// ---------------------------------------------------------------------------
// Frontend
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RecordingFrontend {
    states: Mutex<Vec<UiState>>,
    products: Mutex<Vec<ProductRecommendation>>,
}

impl RecordingFrontend {
    fn last(&self) -> Option<UiState> {
        self.states.lock().unwrap().last().cloned()
    }

    fn status(&self) -> Option<CallStatus> {
        self.last().map(|s| s.status)
    }
}

impl Frontend for RecordingFrontend {
    fn emit_ui(&self, ui: &UiState) {
        self.states.lock().unwrap().push(ui.clone());
    }
}

impl ProductDisplay for RecordingFrontend {
    fn show_product(&self, product: &ProductRecommendation) -> String {
        self.products.lock().unwrap().push(product.clone());
        "Product displayed to user.".to_string()
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    host: Arc<FakeHost>,
    connector: Arc<ScriptedConnector>,
    frontend: Arc<RecordingFrontend>,
    runner: Arc<SessionEffectRunner>,
    metrics: Arc<Mutex<MetricsCollector>>,
    handle: StateLoopHandle,
}

fn harness() -> Harness {
    harness_with(FakeHost::default())
}

fn harness_with(host: FakeHost) -> Harness {
    let host = Arc::new(host);
    let connector = Arc::new(ScriptedConnector::default());
    let frontend = Arc::new(RecordingFrontend::default());
    let metrics = Arc::new(Mutex::new(MetricsCollector::new()));

    let config = SessionConfig {
        error_reset: Duration::from_millis(50),
        ..SessionConfig::default()
    };
    let runner = SessionEffectRunner::new(
        host.clone(),
        connector.clone(),
        frontend.clone(),
        config,
        metrics.clone(),
    );
    let (handle, _task) = CallController::start(frontend.clone(), runner.clone());

    Harness {
        host,
        connector,
        frontend,
        runner,
        metrics,
        handle,
    }
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..300 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn server(json: &str) -> TransportEvent {
    TransportEvent::Message(serde_json::from_str::<ServerMessage>(json).unwrap())
}

fn audio_chunk(seconds: f64) -> String {
    let frames = (seconds * 24_000.0) as usize;
    STANDARD.encode(encode_pcm16(&vec![0.25; frames]))
}

/// Start a call and bring it to Active; returns the link index
async fn connect(h: &Harness) -> usize {
    let index = h.connector.count();
    let starts = h.host.starts();
    h.handle.send(Event::StartCall).await.unwrap();
    wait_until("connect", || h.connector.count() > index).await;

    let runner = h.runner.clone();
    wait_until("session installed", || runner.has_session()).await;
    h.connector
        .events(index)
        .send(TransportEvent::Opened)
        .await
        .unwrap();
    wait_until("active", || h.frontend.status() == Some(CallStatus::Active)).await;
    wait_until("microphone started", || h.host.starts() > starts).await;
    index
}

// ---------------------------------------------------------------------------
// Flows
// ---------------------------------------------------------------------------

#[tokio::test]
async fn setup_carries_persona_and_tool() {
    let h = harness();
    let index = connect(&h).await;

    let links = h.connector.links.lock().unwrap();
    let setup = serde_json::to_value(&links[index].setup).unwrap();
    assert!(setup["setup"]["model"]
        .as_str()
        .unwrap()
        .starts_with("models/"));
    assert!(setup["setup"]["systemInstruction"]["parts"][0]["text"]
        .as_str()
        .unwrap()
        .contains("Sales Boss"));
    assert_eq!(
        setup["setup"]["tools"][0]["functionDeclarations"][0]["name"],
        "recommendProduct"
    );
}

#[tokio::test]
async fn captured_audio_is_streamed_in_fixed_frames() {
    let h = harness();
    let index = connect(&h).await;
    assert_eq!(h.host.starts(), 1);

    // 1.5 frames: only one complete block goes out
    h.host.speak(&vec![0.1; 4096 + 2048]);
    let sent = h.connector.drain(index);
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        ClientMessage::RealtimeInput(input) => {
            assert_eq!(input.media_chunks.len(), 1);
            assert_eq!(input.media_chunks[0].mime_type, "audio/pcm;rate=16000");
            assert_eq!(STANDARD.decode(&input.media_chunks[0].data).unwrap().len(), 8192);
        }
        other => panic!("unexpected {:?}", other),
    }

    h.host.speak(&vec![0.1; 2048]);
    assert_eq!(h.connector.drain(index).len(), 1);
}

#[tokio::test]
async fn mute_stops_outbound_frames() {
    let h = harness();
    let index = connect(&h).await;

    h.handle.send(Event::ToggleMute).await.unwrap();
    wait_until("muted", || h.frontend.last().map(|s| s.muted) == Some(true)).await;

    h.host.speak(&vec![0.1; 4096 * 2]);
    assert!(h.connector.drain(index).is_empty());

    h.handle.send(Event::ToggleMute).await.unwrap();
    wait_until("unmuted", || h.frontend.last().map(|s| s.muted) == Some(false)).await;

    h.host.speak(&vec![0.1; 4096]);
    assert_eq!(h.connector.drain(index).len(), 1);
}

#[tokio::test]
async fn recommend_product_is_shown_and_answered_once() {
    let h = harness();
    let index = connect(&h).await;
    let events = h.connector.events(index);

    let call = r#"{"toolCall":{"functionCalls":[{"id":"call-1","name":"recommendProduct",
        "args":{"name":"Solar Lantern","price":"$25","description":"Lights up the night"}}]}}"#;
    events.send(server(call)).await.unwrap();
    // A repeated id must not produce a second response
    events.send(server(call)).await.unwrap();

    wait_until("product shown", || !h.frontend.products.lock().unwrap().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let products = h.frontend.products.lock().unwrap().clone();
    assert_eq!(products.len(), 1);
    assert_eq!(products[0].name, "Solar Lantern");
    assert_eq!(products[0].rating, 4.5);

    let responses: Vec<_> = h
        .connector
        .drain(index)
        .into_iter()
        .filter_map(|m| match m {
            ClientMessage::ToolResponse(r) => Some(r),
            _ => None,
        })
        .collect();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].function_responses[0].id, "call-1");
    assert_eq!(responses[0].function_responses[0].name, "recommendProduct");
    assert_eq!(
        responses[0].function_responses[0].response["result"],
        "Product displayed"
    );
}

#[tokio::test]
async fn unknown_tool_gets_no_response() {
    let h = harness();
    let index = connect(&h).await;
    let events = h.connector.events(index);

    events
        .send(server(
            r#"{"toolCall":{"functionCalls":[{"id":"x","name":"launchRocket","args":{}}]}}"#,
        ))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(h.connector.drain(index).is_empty());
    assert_eq!(h.frontend.status(), Some(CallStatus::Active));
}

#[tokio::test]
async fn inbound_audio_plays_gapless_and_interrupt_stops_it() {
    let h = harness();
    let index = connect(&h).await;
    let events = h.connector.events(index);

    for _ in 0..3 {
        let msg = format!(
            r#"{{"serverContent":{{"modelTurn":{{"parts":[{{"inlineData":{{"mimeType":"audio/pcm;rate=24000","data":"{}"}}}}]}}}}}}"#,
            audio_chunk(0.5)
        );
        events.send(server(&msg)).await.unwrap();
    }
    // Malformed chunk is dropped without affecting the call
    events
        .send(server(
            r#"{"serverContent":{"modelTurn":{"parts":[{"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AAA"}}]}}}"#,
        ))
        .await
        .unwrap();

    let output = h.host.output.clone();
    wait_until("three chunks", || output.lock().unwrap().started.len() == 3).await;
    {
        let log = output.lock().unwrap();
        for pair in log.started.windows(2) {
            let (_, start, duration) = pair[0];
            let (_, next_start, _) = pair[1];
            assert!((next_start - (start + duration)).abs() < 1e-9);
        }
    }

    events
        .send(server(r#"{"serverContent":{"interrupted":true}}"#))
        .await
        .unwrap();
    wait_until("stopped", || output.lock().unwrap().stopped.len() == 3).await;

    // The next chunk starts fresh against the clock
    let msg = format!(
        r#"{{"serverContent":{{"modelTurn":{{"parts":[{{"inlineData":{{"mimeType":"audio/pcm;rate=24000","data":"{}"}}}}]}}}}}}"#,
        audio_chunk(0.1)
    );
    events.send(server(&msg)).await.unwrap();
    wait_until("fresh chunk", || output.lock().unwrap().started.len() == 4).await;
    assert_eq!(output.lock().unwrap().started[3].1, 0.0);
    assert_eq!(h.frontend.status(), Some(CallStatus::Active));
}

#[tokio::test]
async fn end_call_releases_everything() {
    let h = harness();
    let index = connect(&h).await;

    h.handle.send(Event::EndCall).await.unwrap();
    wait_until("idle", || h.frontend.status() == Some(CallStatus::Idle)).await;

    assert!(!h.runner.has_session());
    // Devices are released off the state loop
    wait_until("microphone stopped", || h.host.stops() == 1).await;
    let output = h.host.output.clone();
    wait_until("speaker closed", || output.lock().unwrap().closed == 1).await;
    wait_until("outbound closed", || h.connector.outbound_closed(index)).await;

    // Frames after teardown go nowhere
    h.host.speak(&vec![0.1; 4096]);
    assert!(h.connector.drain(index).is_empty());

    let summary = h.metrics.lock().unwrap().get_summary();
    assert_eq!(summary.total_calls, 1);
    assert_eq!(summary.successful_calls, 1);
}

#[tokio::test]
async fn end_while_connecting_then_call_again() {
    let h = harness();

    h.handle.send(Event::StartCall).await.unwrap();
    wait_until("connecting", || h.frontend.status() == Some(CallStatus::Connecting)).await;
    h.handle.send(Event::EndCall).await.unwrap();
    wait_until("idle", || h.frontend.status() == Some(CallStatus::Idle)).await;

    let runner = h.runner.clone();
    wait_until("released", || !runner.has_session()).await;

    connect(&h).await;
    assert_eq!(h.frontend.status(), Some(CallStatus::Active));
}

#[tokio::test]
async fn abnormal_close_errors_then_resets() {
    let h = harness();
    let index = connect(&h).await;

    h.connector
        .events(index)
        .send(TransportEvent::Closed {
            code: Some(1011),
            reason: "internal error".into(),
        })
        .await
        .unwrap();

    let errored = || {
        h.frontend
            .states
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.status == CallStatus::Error)
            .cloned()
    };
    wait_until("error", || errored().is_some()).await;
    let error = errored().and_then(|s| s.error).unwrap();
    assert!(error.contains("internal error"));
    assert!(!h.runner.has_session());

    wait_until("reset", || h.frontend.status() == Some(CallStatus::Idle)).await;

    let summary = h.metrics.lock().unwrap().get_summary();
    assert_eq!(summary.failed_calls, 1);
    assert!(summary.last_error.is_some());
}

#[tokio::test]
async fn normal_close_returns_to_idle() {
    let h = harness();
    let index = connect(&h).await;

    h.connector
        .events(index)
        .send(TransportEvent::Closed {
            code: Some(1000),
            reason: "bye".into(),
        })
        .await
        .unwrap();

    wait_until("idle", || h.frontend.status() == Some(CallStatus::Idle)).await;
    assert!(!h
        .frontend
        .states
        .lock()
        .unwrap()
        .iter()
        .any(|s| s.status == CallStatus::Error));
}

#[tokio::test]
async fn slow_microphone_start_does_not_stall_end_call() {
    let h = harness_with(FakeHost {
        start_delay: Duration::from_millis(1500),
        ..FakeHost::default()
    });

    h.handle.send(Event::StartCall).await.unwrap();
    wait_until("connect", || h.connector.count() == 1).await;
    let runner = h.runner.clone();
    wait_until("session installed", || runner.has_session()).await;
    h.connector
        .events(0)
        .send(TransportEvent::Opened)
        .await
        .unwrap();
    wait_until("active", || h.frontend.status() == Some(CallStatus::Active)).await;

    let ended = Instant::now();
    h.handle.send(Event::EndCall).await.unwrap();
    wait_until("idle", || h.frontend.status() == Some(CallStatus::Idle)).await;
    assert!(ended.elapsed() < Duration::from_millis(500));
    assert!(!h.runner.has_session());

    // The microphone that finished starting after the call ended is released
    wait_until("late start", || h.host.starts() == 1).await;
    wait_until("late stop", || h.host.stops() == 1).await;
}

#[tokio::test]
async fn microphone_start_failure_errors_the_call() {
    let h = harness_with(FakeHost {
        refuse_start: true,
        ..FakeHost::default()
    });

    h.handle.send(Event::StartCall).await.unwrap();
    wait_until("connect", || h.connector.count() == 1).await;
    let runner = h.runner.clone();
    wait_until("session installed", || runner.has_session()).await;
    h.connector
        .events(0)
        .send(TransportEvent::Opened)
        .await
        .unwrap();

    let errored = || {
        h.frontend
            .states
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.status == CallStatus::Error)
            .cloned()
    };
    wait_until("error", || errored().is_some()).await;
    assert!(errored().and_then(|s| s.error).unwrap().contains("device busy"));
    assert!(!h.runner.has_session());
    wait_until("reset", || h.frontend.status() == Some(CallStatus::Idle)).await;
}
