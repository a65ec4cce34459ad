//! Effect runner for Sales Boss Live
//!
//! Executes the effects produced by the state machine. The runner owns the
//! single session slot; every device and connection belongs to the
//! `SessionHandle` stored there and is released when the handle is dropped.
//!
//! Effects touching the live session's inbound path (`PlayAudio`,
//! `InterruptPlayback`, `InvokeTool`) run inline on the state loop, so they
//! are applied in arrival order, one event at a time.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audio::{
    create_level_tap, run_level_meter, AudioFrame, AudioHost, CaptureConfig, CaptureCounters,
    CapturePipeline, FrameSink, LevelFrame, LevelTap, MeterSource, MuteControl,
};
use crate::live::{ClientMessage, LiveConnector, TransportEvent};
use crate::metrics::MetricsCollector;
use crate::persona::SYSTEM_INSTRUCTION;
use crate::playback::PlaybackScheduler;
use crate::settings::AppSettings;
use crate::state_machine::{Effect, Event};
use crate::tools::{function_declarations, ProductDisplay, ToolDispatcher, ToolInvocationError};

/// How long the writer gets to flush a close frame before its task is aborted
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Trait for running effects.
/// Completion events are sent back via the provided channel.
pub trait EffectRunner: Send + Sync + 'static {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>);

    /// Release everything before the state loop exits
    fn shutdown(&self) {}
}

/// Receives meter frames while a call is active
pub type LevelPublisher = Arc<dyn Fn(LevelFrame) + Send + Sync>;

/// Per-call settings for the session runner
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub live_model: String,
    pub voice: String,
    pub capture: CaptureConfig,
    pub output_device: Option<String>,
    /// Channel layout of inbound speech
    pub playback_channels: u16,
    pub error_reset: Duration,
}

impl SessionConfig {
    pub fn from_settings(settings: &AppSettings) -> Self {
        Self {
            live_model: settings.live_model.clone(),
            voice: settings.voice.clone(),
            capture: CaptureConfig {
                sample_rate: settings.input_sample_rate,
                block_size: settings.capture_block_size,
                device: settings.input_device().map(str::to_string),
            },
            output_device: settings.output_device().map(str::to_string),
            playback_channels: 1,
            error_reset: Duration::from_millis(settings.error_reset_ms),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_settings(&AppSettings::default())
    }
}

/// Everything one live call owns
///
/// Dropping the handle stops capture, stops playback, closes the outbound
/// queue and ends the IO tasks. Exactly one exists at a time. Dropping joins
/// device threads, so handles are disposed off the async runtime.
pub struct SessionHandle {
    call_id: Uuid,
    /// `None` while the device is being started
    capture: Option<CapturePipeline>,
    mute: MuteControl,
    counters: Arc<CaptureCounters>,
    playback: PlaybackScheduler,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    tools: ToolDispatcher,
    /// Forwards transport events to the state loop
    pump: JoinHandle<()>,
    link_tasks: Vec<JoinHandle<()>>,
    mic_tap: Option<LevelTap>,
    meters: CancellationToken,
}

/// A capture pipeline handed out for starting, with its wiring
struct PendingCapture {
    capture: CapturePipeline,
    sink: FrameSink,
    tap: Option<LevelTap>,
}

impl SessionHandle {
    /// Take the idle pipeline out together with a sink feeding the outbound queue
    fn take_capture(&mut self) -> Option<PendingCapture> {
        let capture = self.capture.take()?;
        let outbound = self.outbound.clone();
        let sink: FrameSink = Box::new(move |frame: AudioFrame| {
            // Fails only once the writer is gone; the pump reports that
            let _ = outbound.send(ClientMessage::audio(&frame));
        });
        Some(PendingCapture {
            capture,
            sink,
            tap: self.mic_tap.take(),
        })
    }

    fn send(&self, msg: ClientMessage) {
        if self.outbound.send(msg).is_err() {
            log::warn!("Outbound queue closed for call {}", self.call_id);
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if let Some(capture) = self.capture.as_mut() {
            capture.stop();
        }
        self.playback.close();
        self.meters.cancel();
        self.pump.abort();

        // `outbound` drops with the handle, which lets the writer send a close frame
        let tasks = std::mem::take(&mut self.link_tasks);
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    tokio::time::sleep(CLOSE_GRACE).await;
                    for task in tasks {
                        task.abort();
                    }
                });
            }
            Err(_) => {
                for task in tasks {
                    task.abort();
                }
            }
        }

        log::info!("Session {} disposed", self.call_id);
    }
}

/// Release device resources on the blocking pool
fn dispose<T: Send + 'static>(resource: T) {
    match tokio::runtime::Handle::try_current() {
        Ok(rt) => {
            rt.spawn_blocking(move || drop(resource));
        }
        Err(_) => drop(resource),
    }
}

/// The single session slot
enum SessionSlot {
    Empty,
    /// Devices and connection are being set up by `task`
    Opening { call_id: Uuid, task: JoinHandle<()> },
    Live(Box<SessionHandle>),
}

/// Shared pieces the opening task needs
#[derive(Clone)]
struct SessionDeps {
    host: Arc<dyn AudioHost>,
    connector: Arc<dyn LiveConnector>,
    display: Arc<dyn ProductDisplay>,
    levels: Option<LevelPublisher>,
    config: SessionConfig,
    slot: Arc<Mutex<SessionSlot>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Real effect runner: CPAL devices and a live connection per call
pub struct SessionEffectRunner {
    deps: SessionDeps,
    metrics: Arc<Mutex<MetricsCollector>>,
}

impl SessionEffectRunner {
    pub fn new(
        host: Arc<dyn AudioHost>,
        connector: Arc<dyn LiveConnector>,
        display: Arc<dyn ProductDisplay>,
        config: SessionConfig,
        metrics: Arc<Mutex<MetricsCollector>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            deps: SessionDeps {
                host,
                connector,
                display,
                levels: None,
                config,
                slot: Arc::new(Mutex::new(SessionSlot::Empty)),
            },
            metrics,
        })
    }

    /// Same as `new`, also publishing microphone and speaker levels
    pub fn with_meter(
        host: Arc<dyn AudioHost>,
        connector: Arc<dyn LiveConnector>,
        display: Arc<dyn ProductDisplay>,
        config: SessionConfig,
        metrics: Arc<Mutex<MetricsCollector>>,
        levels: LevelPublisher,
    ) -> Arc<Self> {
        Arc::new(Self {
            deps: SessionDeps {
                host,
                connector,
                display,
                levels: Some(levels),
                config,
                slot: Arc::new(Mutex::new(SessionSlot::Empty)),
            },
            metrics,
        })
    }

    /// Whether a live session for `call_id` is installed
    pub fn is_live(&self, call_id: Uuid) -> bool {
        matches!(&*lock(&self.deps.slot), SessionSlot::Live(h) if h.call_id == call_id)
    }

    /// Whether any session (opening or live) exists
    pub fn has_session(&self) -> bool {
        !matches!(&*lock(&self.deps.slot), SessionSlot::Empty)
    }

    /// Run `f` on the live session for `id`, if there is one
    fn with_live<R>(&self, id: Uuid, f: impl FnOnce(&mut SessionHandle) -> R) -> Option<R> {
        let mut slot = lock(&self.deps.slot);
        match &mut *slot {
            SessionSlot::Live(handle) if handle.call_id == id => Some(f(handle.as_mut())),
            _ => None,
        }
    }

    fn open_session(&self, id: Uuid, tx: mpsc::Sender<Event>) {
        self.lock_metrics().start_call(id);

        // Hold the slot while spawning so the task can't finish before Opening is stored
        let mut slot = lock(&self.deps.slot);
        let previous = std::mem::replace(&mut *slot, SessionSlot::Empty);
        match previous {
            SessionSlot::Empty => {}
            SessionSlot::Opening { call_id, task } => {
                log::warn!("Aborting unfinished session {} for call {}", call_id, id);
                task.abort();
            }
            SessionSlot::Live(handle) => {
                log::warn!("Replacing live session {} for call {}", handle.call_id, id);
                dispose(handle);
            }
        }

        let task = tokio::spawn(open_session_task(self.deps.clone(), id, tx));
        *slot = SessionSlot::Opening { call_id: id, task };
    }

    fn teardown(&self, id: Uuid, error: Option<String>) {
        let taken = {
            let mut slot = lock(&self.deps.slot);
            let matches = match &*slot {
                SessionSlot::Opening { call_id, .. } => *call_id == id,
                SessionSlot::Live(handle) => handle.call_id == id,
                SessionSlot::Empty => false,
            };
            if matches {
                std::mem::replace(&mut *slot, SessionSlot::Empty)
            } else {
                SessionSlot::Empty
            }
        };

        match taken {
            SessionSlot::Empty => log::debug!("Teardown {}: nothing to release", id),
            SessionSlot::Opening { task, .. } => {
                log::info!("Teardown {}: aborting session setup", id);
                task.abort();
            }
            SessionSlot::Live(handle) => {
                let counters = handle.counters.clone();
                dispose(handle);
                self.lock_metrics()
                    .capture_totals(id, counters.sent(), counters.muted());
            }
        }

        let mut metrics = self.lock_metrics();
        match error {
            None => metrics.call_ended(id),
            Some(message) => metrics.call_failed(id, message),
        }
    }

    fn lock_metrics(&self) -> MutexGuard<'_, MetricsCollector> {
        lock(&self.metrics)
    }
}

/// Acquire devices, connect, then install the session if the call is still wanted
async fn open_session_task(deps: SessionDeps, id: Uuid, tx: mpsc::Sender<Event>) {
    if let Err(err) = open_session_inner(&deps, id, &tx).await {
        log::error!("Call {} could not start: {}", id, err);
        let _ = tx.send(Event::SessionFailed { id, err }).await;
    }
}

async fn open_session_inner(
    deps: &SessionDeps,
    id: Uuid,
    tx: &mpsc::Sender<Event>,
) -> Result<(), String> {
    let meters = CancellationToken::new();
    let (mic_tap, speaker_tap) = match &deps.levels {
        Some(publish) => {
            let (mic_tx, mic_rx) = create_level_tap();
            let (spk_tx, spk_rx) = create_level_tap();
            tokio::spawn(run_level_meter(
                MeterSource::Microphone,
                mic_rx,
                meters.clone(),
                publish.clone(),
            ));
            tokio::spawn(run_level_meter(
                MeterSource::Speaker,
                spk_rx,
                meters.clone(),
                publish.clone(),
            ));
            (Some(mic_tx), Some(spk_tx))
        }
        None => (None, None),
    };

    // Device setup blocks on the audio threads
    let host = deps.host.clone();
    let config = deps.config.clone();
    let devices = tokio::task::spawn_blocking(move || {
        let output = host.open_output(config.output_device.as_deref(), speaker_tap)?;
        let capture = CapturePipeline::open(host.as_ref(), config.capture.clone())?;
        Ok::<_, crate::audio::AudioError>((output, capture))
    })
    .await
    .map_err(|e| format!("Device setup task failed: {}", e));

    let (output, capture) = match devices {
        Ok(Ok(devices)) => devices,
        Ok(Err(e)) => {
            meters.cancel();
            return Err(e.to_string());
        }
        Err(e) => {
            meters.cancel();
            return Err(e);
        }
    };
    let playback = PlaybackScheduler::new(output, deps.config.playback_channels);

    let setup = ClientMessage::setup(
        &deps.config.live_model,
        &deps.config.voice,
        Some(SYSTEM_INSTRUCTION),
        function_declarations(),
    );
    let link = match deps.connector.connect(setup).await {
        Ok(link) => link,
        Err(e) => {
            meters.cancel();
            // capture and playback release on drop
            return Err(e.to_string());
        }
    };

    let mut slot = lock(&deps.slot);
    let still_wanted = matches!(&*slot, SessionSlot::Opening { call_id, .. } if *call_id == id);

    let pump = tokio::spawn(pump_events(id, link.events, tx.clone()));
    let handle = SessionHandle {
        call_id: id,
        mute: capture.mute_control(),
        counters: capture.counters(),
        capture: Some(capture),
        playback,
        outbound: link.outbound,
        tools: ToolDispatcher::new(deps.display.clone()),
        pump,
        link_tasks: link.tasks,
        mic_tap,
        meters,
    };

    if still_wanted {
        log::info!("Session {} connected, waiting for the stream to open", id);
        *slot = SessionSlot::Live(Box::new(handle));
    } else {
        drop(slot);
        log::info!("Call {} ended while connecting, disposing session", id);
        dispose(handle);
    }
    Ok(())
}

/// Translate transport events into state machine events for one call
async fn pump_events(
    id: Uuid,
    mut events: mpsc::Receiver<TransportEvent>,
    tx: mpsc::Sender<Event>,
) {
    while let Some(event) = events.recv().await {
        let (event, last) = match event {
            TransportEvent::Opened => (Event::StreamOpened { id }, false),
            TransportEvent::Message(msg) => (
                Event::Inbound {
                    id,
                    msg: Box::new(msg),
                },
                false,
            ),
            TransportEvent::Closed { code, reason } => {
                (Event::StreamClosed { id, code, reason }, true)
            }
            TransportEvent::Error(err) => (Event::StreamFailed { id, err }, true),
        };
        if tx.send(event).await.is_err() || last {
            return;
        }
    }

    let _ = tx
        .send(Event::StreamClosed {
            id,
            code: None,
            reason: "transport ended".to_string(),
        })
        .await;
}

/// Start the device on the blocking pool, then hand the pipeline back to its session
async fn start_capture(
    slot: Arc<Mutex<SessionSlot>>,
    id: Uuid,
    pending: PendingCapture,
    tx: mpsc::Sender<Event>,
) {
    let PendingCapture {
        mut capture,
        sink,
        tap,
    } = pending;
    let started = tokio::task::spawn_blocking(move || {
        let result = capture.start(sink, tap);
        (capture, result)
    })
    .await;

    let err = match started {
        Ok((capture, Ok(()))) => {
            if let Some(orphan) = return_capture(&slot, id, capture) {
                log::info!("Call {} ended while capture was starting", id);
                dispose(orphan);
            } else {
                log::info!("Call {} is live", id);
            }
            return;
        }
        Ok((capture, Err(e))) => {
            dispose(capture);
            e.to_string()
        }
        Err(e) => format!("Capture start task failed: {}", e),
    };
    log::error!("Call {}: microphone failed to start: {}", id, err);
    let _ = tx.send(Event::SessionFailed { id, err }).await;
}

/// Put a started pipeline back; returns it if its session is gone
fn return_capture(
    slot: &Mutex<SessionSlot>,
    id: Uuid,
    capture: CapturePipeline,
) -> Option<CapturePipeline> {
    match &mut *lock(slot) {
        SessionSlot::Live(handle) if handle.call_id == id => {
            handle.capture = Some(capture);
            None
        }
        _ => Some(capture),
    }
}

impl EffectRunner for SessionEffectRunner {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>) {
        match effect {
            Effect::OpenSession { id } => self.open_session(id, tx),

            Effect::StartCapture { id } => {
                self.lock_metrics().call_opened(id);
                match self.with_live(id, |h| h.take_capture()) {
                    Some(Some(pending)) => {
                        tokio::spawn(start_capture(self.deps.slot.clone(), id, pending, tx));
                    }
                    Some(None) => log::warn!("StartCapture {}: capture already started", id),
                    None => log::warn!("StartCapture {}: no live session", id),
                }
            }

            Effect::SetMuted { id, muted } => {
                if self.with_live(id, |h| h.mute.set(muted)).is_none() {
                    log::debug!("SetMuted {}: no live session", id);
                }
            }

            Effect::PlayAudio {
                id,
                data,
                sample_rate,
            } => {
                let result = self.with_live(id, |h| h.playback.enqueue_base64(&data, sample_rate));
                match result {
                    Some(Ok(chunk)) => {
                        log::debug!(
                            "Scheduled chunk {} at {:.3}s ({:.3}s)",
                            chunk.id,
                            chunk.start,
                            chunk.duration
                        );
                        self.lock_metrics().chunk_scheduled(id);
                    }
                    Some(Err(e)) => {
                        log::warn!("Dropping inbound audio chunk: {}", e);
                        self.lock_metrics().chunk_dropped(id);
                    }
                    None => log::debug!("PlayAudio {}: no live session", id),
                }
            }

            Effect::InterruptPlayback { id } => {
                if let Some(stopped) = self.with_live(id, |h| h.playback.interrupt()) {
                    log::info!("Playback interrupted, {} chunk(s) stopped", stopped);
                    self.lock_metrics().interruption(id);
                }
            }

            Effect::InvokeTool { id, call } => {
                let result = self.with_live(id, |h| {
                    let result = h.tools.invoke(&call);
                    if let Ok(response) = &result {
                        h.send(response.clone());
                    }
                    result
                });
                match result {
                    Some(Ok(_)) => {
                        log::info!("Answered tool call {} ({})", call.id, call.name);
                        self.lock_metrics().tool_call(id);
                    }
                    Some(Err(e @ ToolInvocationError::UnknownTool(_))) => {
                        log::warn!("Ignoring tool call {}: {}", call.id, e);
                    }
                    Some(Err(e)) => log::warn!("Tool call {} not answered: {}", call.id, e),
                    None => log::debug!("InvokeTool {}: no live session", id),
                }
            }

            Effect::Teardown { id, error } => self.teardown(id, error),

            Effect::ScheduleErrorReset { id } => {
                let delay = self.deps.config.error_reset;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(Event::ErrorReset { id }).await;
                });
            }

            Effect::EmitUi => {
                // Handled by the state loop
            }
        }
    }

    fn shutdown(&self) {
        let taken = std::mem::replace(&mut *lock(&self.deps.slot), SessionSlot::Empty);
        match taken {
            SessionSlot::Empty => {}
            SessionSlot::Opening { call_id, task } => {
                log::info!("Shutdown: aborting session setup {}", call_id);
                task.abort();
            }
            SessionSlot::Live(handle) => {
                let id = handle.call_id;
                // Released in place: the process is about to exit
                drop(handle);
                self.lock_metrics().call_ended(id);
            }
        }
    }
}
