pub mod audio;
pub mod chat;
pub mod effects;
pub mod live;
pub mod metrics;
pub mod persona;
pub mod playback;
pub mod settings;
pub mod state_machine;
pub mod tools;

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

use effects::EffectRunner;
use state_machine::{reduce, Effect, Event, State};

/// Capacity of the state loop's event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Call status as shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CallStatus {
    Idle,
    Connecting,
    Active,
    Error,
}

/// Which controls are enabled; a pure function of the state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Controls {
    pub can_call: bool,
    pub can_end: bool,
    pub can_mute: bool,
    /// Text chat is off while a call is live
    pub can_chat: bool,
}

impl Controls {
    pub fn for_state(state: &State) -> Self {
        match state {
            State::Idle => Self {
                can_call: true,
                can_end: false,
                can_mute: false,
                can_chat: true,
            },
            State::Connecting { .. } => Self {
                can_call: false,
                can_end: true,
                can_mute: false,
                can_chat: true,
            },
            State::Active { .. } => Self {
                can_call: false,
                can_end: true,
                can_mute: true,
                can_chat: false,
            },
            State::Error { .. } => Self {
                can_call: false,
                can_end: false,
                can_mute: false,
                can_chat: true,
            },
        }
    }
}

/// UI state sent to the frontend.
/// Serialises as `{ "status": "active", "muted": false, "controls": {...} }`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UiState {
    pub status: CallStatus,
    pub muted: bool,
    pub controls: Controls,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Convert internal State to UiState for the frontend
pub fn state_to_ui(state: &State) -> UiState {
    let (status, muted, error) = match state {
        State::Idle => (CallStatus::Idle, false, None),
        State::Connecting { .. } => (CallStatus::Connecting, false, None),
        State::Active { muted, .. } => (CallStatus::Active, *muted, None),
        State::Error { message, .. } => (CallStatus::Error, false, Some(message.clone())),
    };
    UiState {
        status,
        muted,
        controls: Controls::for_state(state),
        error,
    }
}

/// Anything that can show call state
pub trait Frontend: Send + Sync + 'static {
    fn emit_ui(&self, ui: &UiState);
}

fn emit_ui_state(frontend: &dyn Frontend, state: &State) {
    let ui_state = state_to_ui(state);
    log::debug!("Emitting UI state: {:?}", serde_json::to_string(&ui_state));
    frontend.emit_ui(&ui_state);
}

/// State loop manager - holds the event sender for dispatching events
#[derive(Clone)]
pub struct StateLoopHandle {
    tx: mpsc::Sender<Event>,
}

impl StateLoopHandle {
    /// Send an event to the state machine
    pub async fn send(&self, event: Event) -> Result<(), mpsc::error::SendError<Event>> {
        self.tx.send(event).await
    }
}

/// Run the main state loop
pub async fn run_state_loop(
    frontend: Arc<dyn Frontend>,
    mut rx: mpsc::Receiver<Event>,
    tx: mpsc::Sender<Event>,
    effect_runner: Arc<dyn EffectRunner>,
) {
    let mut state = State::default();

    // Emit initial state
    emit_ui_state(frontend.as_ref(), &state);
    log::info!("State loop started");

    while let Some(event) = rx.recv().await {
        log::debug!("Received event: {:?}", event);

        // Handle Exit at the edge
        if matches!(event, Event::Exit) {
            log::info!("Exit requested, shutting down state loop");
            effect_runner.shutdown();
            break;
        }

        let old_discriminant = std::mem::discriminant(&state);
        let (next, effects) = reduce(&state, event);
        let new_discriminant = std::mem::discriminant(&next);

        // Log state transitions
        if old_discriminant != new_discriminant {
            log::info!("State transition: {:?} -> {:?}", state, next);
        }

        state = next;

        // Execute effects
        for eff in effects {
            match eff {
                Effect::EmitUi => emit_ui_state(frontend.as_ref(), &state),
                other => effect_runner.spawn(other, tx.clone()),
            }
        }
    }

    log::info!("State loop ended");
}

/// Starts the state loop on the current tokio runtime
pub struct CallController;

impl CallController {
    pub fn start(
        frontend: Arc<dyn Frontend>,
        effect_runner: Arc<dyn EffectRunner>,
    ) -> (StateLoopHandle, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let task = tokio::spawn(run_state_loop(frontend, rx, tx.clone(), effect_runner));
        (StateLoopHandle { tx }, task)
    }
}
