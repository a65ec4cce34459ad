//! State machine for a live sales call
//!
//! Single-writer pattern: all transitions go through `reduce()`, which
//! returns the next state and the effects to execute. Device and network
//! work happens in the effect runner, which reports back with events tagged
//! by call id.

use crate::audio::pcm::{parse_pcm_rate, OUTPUT_SAMPLE_RATE};
use crate::live::protocol::{FunctionCall, ServerMessage};
use crate::live::NORMAL_CLOSE_CODE;
use uuid::Uuid;

/// Call lifecycle state. Authoritative; only the reducer changes it.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum State {
    #[default]
    Idle,
    Connecting {
        call_id: Uuid,
    },
    Active {
        call_id: Uuid,
        muted: bool,
    },
    Error {
        call_id: Uuid,
        message: String,
    },
}

impl State {
    pub fn call_id(&self) -> Option<Uuid> {
        match self {
            State::Idle => None,
            State::Connecting { call_id }
            | State::Active { call_id, .. }
            | State::Error { call_id, .. } => Some(*call_id),
        }
    }
}

/// Events that can trigger state transitions.
/// User commands come from the frontend; the rest from the effect runner.
#[derive(Debug, Clone)]
pub enum Event {
    /// User pressed "call"
    StartCall,
    /// User pressed "end call"
    EndCall,
    /// User toggled the microphone
    ToggleMute,
    SetMuted {
        muted: bool,
    },
    /// Application exit requested (handled by the state loop)
    Exit,

    // Session events
    /// Devices or connection could not be set up, or capture failed to start
    SessionFailed {
        id: Uuid,
        err: String,
    },
    /// Handshake complete
    StreamOpened {
        id: Uuid,
    },
    Inbound {
        id: Uuid,
        msg: Box<ServerMessage>,
    },
    StreamClosed {
        id: Uuid,
        code: Option<u16>,
        reason: String,
    },
    StreamFailed {
        id: Uuid,
        err: String,
    },
    /// Error display timeout (includes id to prevent stale resets)
    ErrorReset {
        id: Uuid,
    },
}

/// Effects to be executed after a state transition.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Acquire devices and connect; reports StreamOpened or SessionFailed
    OpenSession {
        id: Uuid,
    },
    /// Start streaming microphone frames
    StartCapture {
        id: Uuid,
    },
    SetMuted {
        id: Uuid,
        muted: bool,
    },
    /// Answer a tool call
    InvokeTool {
        id: Uuid,
        call: FunctionCall,
    },
    /// Schedule one inbound speech chunk
    PlayAudio {
        id: Uuid,
        data: String,
        sample_rate: u32,
    },
    /// Stop everything queued for playback
    InterruptPlayback {
        id: Uuid,
    },
    /// Dispose the session and release every resource
    Teardown {
        id: Uuid,
        /// Why the call failed; `None` for an orderly end
        error: Option<String>,
    },
    /// Return from Error to Idle after the display delay
    ScheduleErrorReset {
        id: Uuid,
    },
    /// Signal to emit UI state to the frontend
    EmitUi,
}

fn fail(call_id: Uuid, message: String) -> (State, Vec<Effect>) {
    (
        State::Error {
            call_id,
            message: message.clone(),
        },
        vec![
            Effect::Teardown {
                id: call_id,
                error: Some(message),
            },
            Effect::ScheduleErrorReset { id: call_id },
            Effect::EmitUi,
        ],
    )
}

/// Effects for one inbound message: tool calls, then audio, then interruption
fn inbound_effects(id: Uuid, msg: &ServerMessage) -> Vec<Effect> {
    let mut effects = Vec::new();

    for call in msg.function_calls() {
        effects.push(Effect::InvokeTool {
            id,
            call: call.clone(),
        });
    }

    for chunk in msg.audio_chunks() {
        effects.push(Effect::PlayAudio {
            id,
            data: chunk.data.clone(),
            sample_rate: parse_pcm_rate(&chunk.mime_type).unwrap_or(OUTPUT_SAMPLE_RATE),
        });
    }

    if msg.is_interrupted() {
        effects.push(Effect::InterruptPlayback { id });
    }

    if msg.is_turn_complete() {
        log::debug!("Model turn complete");
    }
    if let Some(go_away) = &msg.go_away {
        log::warn!("Server will close the stream soon (time left: {:?})", go_away.time_left);
    }
    if let Some(cancel) = &msg.tool_call_cancellation {
        log::info!("Server cancelled tool calls {:?}", cancel.ids);
    }

    effects
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Ignore events with stale call IDs
/// - Always emit EmitUi after state changes
pub fn reduce(state: &State, event: Event) -> (State, Vec<Effect>) {
    use Effect::*;
    use Event::*;
    use State::*;

    let current_id = state.call_id();
    let is_current = |eid: Uuid| Some(eid) == current_id;

    match (state, event) {
        // -----------------
        // Idle
        // -----------------
        (Idle, StartCall) => {
            let id = Uuid::new_v4();
            (Connecting { call_id: id }, vec![OpenSession { id }, EmitUi])
        }
        (Idle, EndCall) => (Idle, vec![]),

        // -----------------
        // Connecting
        // -----------------
        (Connecting { call_id }, StreamOpened { id }) if *call_id == id => (
            Active {
                call_id: id,
                muted: false,
            },
            vec![StartCapture { id }, EmitUi],
        ),
        (Connecting { call_id }, SessionFailed { id, err }) if *call_id == id => fail(id, err),
        (Connecting { call_id }, StreamFailed { id, err }) if *call_id == id => fail(id, err),
        // The stream never opened, so any close is a failure
        (Connecting { call_id }, StreamClosed { id, code, reason }) if *call_id == id => fail(
            id,
            format!("Connection closed before the call started ({:?}) {}", code, reason),
        ),
        (Connecting { call_id }, EndCall) => (
            Idle,
            vec![
                Teardown {
                    id: *call_id,
                    error: None,
                },
                EmitUi,
            ],
        ),

        // -----------------
        // Active
        // -----------------
        (Active { call_id, .. }, Inbound { id, msg }) if *call_id == id => {
            (state.clone(), inbound_effects(id, &msg))
        }
        (Active { call_id, muted }, ToggleMute) => (
            Active {
                call_id: *call_id,
                muted: !*muted,
            },
            vec![
                Effect::SetMuted {
                    id: *call_id,
                    muted: !*muted,
                },
                EmitUi,
            ],
        ),
        (Active { call_id, muted }, Event::SetMuted { muted: wanted }) => {
            if *muted == wanted {
                (state.clone(), vec![])
            } else {
                (
                    Active {
                        call_id: *call_id,
                        muted: wanted,
                    },
                    vec![
                        Effect::SetMuted {
                            id: *call_id,
                            muted: wanted,
                        },
                        EmitUi,
                    ],
                )
            }
        }
        (Active { call_id, .. }, EndCall) => (
            Idle,
            vec![
                Teardown {
                    id: *call_id,
                    error: None,
                },
                EmitUi,
            ],
        ),
        (Active { call_id, .. }, StreamClosed { id, code, reason }) if *call_id == id => {
            if code == Some(NORMAL_CLOSE_CODE) {
                log::info!("Call {} ended by server: {}", id, reason);
                (Idle, vec![Teardown { id, error: None }, EmitUi])
            } else {
                fail(id, format!("Connection lost ({:?}) {}", code, reason))
            }
        }
        (Active { call_id, .. }, StreamFailed { id, err }) if *call_id == id => fail(id, err),
        (Active { call_id, .. }, SessionFailed { id, err }) if *call_id == id => fail(id, err),

        // -----------------
        // Error
        // -----------------
        // Only handle ErrorReset if id matches (prevents stale resets)
        (Error { call_id, .. }, ErrorReset { id }) if *call_id == id => (Idle, vec![EmitUi]),
        (Error { .. }, EndCall) => (state.clone(), vec![]),

        // -----------------
        // Unhandled or stale: no transition
        // -----------------
        (_, Inbound { id, .. }) if !is_current(id) => {
            log::debug!("Dropping inbound message for stale call {}", id);
            (state.clone(), vec![])
        }
        _ => (state.clone(), vec![]),
    }
}
