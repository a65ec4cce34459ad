//! Live conversational audio stream
//!
//! A `LiveConnector` opens the bidirectional stream and hands back a
//! `LiveLink`: an outbound message queue and a channel of lifecycle events.
//!
//! ```text
//!  ClientMessage ──▶ outbound (unbounded) ──▶ writer task ──▶ WebSocket
//!                                                               │
//!  TransportEvent ◀── events (bounded) ◀── reader task ◀────────┘
//!     Opened / Message / Closed / Error
//! ```
//!
//! No reconnection: a dropped stream ends the call.

mod client;
pub mod protocol;

pub use client::{get_api_key, GeminiConnector};
pub use protocol::{ClientMessage, FunctionCall, InlineData, ServerMessage};

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// WebSocket close code for a normal closure
pub const NORMAL_CLOSE_CODE: u16 = 1000;

/// Errors that can occur on the live stream
#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    /// Gemini API key not configured
    MissingApiKey,
    /// Failed to establish the WebSocket connection
    ConnectionFailed(String),
    /// Unexpected or unparseable traffic
    ProtocolError(String),
    /// Connection was closed before or during the call
    Disconnected(String),
    /// Failed to write an outbound message
    SendFailed(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::MissingApiKey => write!(
                f,
                "Gemini API key not configured. Set GEMINI_API_KEY environment variable."
            ),
            TransportError::ConnectionFailed(e) => {
                write!(f, "Failed to connect to Gemini Live API: {}", e)
            }
            TransportError::ProtocolError(e) => write!(f, "Live protocol error: {}", e),
            TransportError::Disconnected(e) => write!(f, "Live stream disconnected: {}", e),
            TransportError::SendFailed(e) => write!(f, "Failed to send message: {}", e),
        }
    }
}

impl std::error::Error for TransportError {}

/// Lifecycle and message events of one live stream
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Handshake completed; audio may flow
    Opened,
    /// A server message after the handshake
    Message(ServerMessage),
    /// The stream closed; `code` is `None` when no close frame arrived
    Closed { code: Option<u16>, reason: String },
    /// The stream failed
    Error(String),
}

impl TransportEvent {
    /// Whether a close event represents an orderly end of the conversation
    pub fn is_normal_close(&self) -> bool {
        matches!(
            self,
            TransportEvent::Closed {
                code: Some(NORMAL_CLOSE_CODE),
                ..
            }
        )
    }
}

/// An open stream: where to send messages and where events arrive
pub struct LiveLink {
    pub outbound: mpsc::UnboundedSender<ClientMessage>,
    pub events: mpsc::Receiver<TransportEvent>,
    /// Background IO tasks owned by this link
    pub tasks: Vec<JoinHandle<()>>,
}

/// Opens live streams
///
/// `GeminiConnector` talks to the real service; tests provide scripted
/// connectors.
pub trait LiveConnector: Send + Sync + 'static {
    /// Connect and send `setup` as the first message
    fn connect(&self, setup: ClientMessage) -> BoxFuture<'static, Result<LiveLink, TransportError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::MissingApiKey;
        assert!(err.to_string().contains("GEMINI_API_KEY"));

        let err = TransportError::ConnectionFailed("dns".to_string());
        assert!(err.to_string().contains("dns"));
    }

    #[test]
    fn test_normal_close() {
        let normal = TransportEvent::Closed {
            code: Some(1000),
            reason: String::new(),
        };
        assert!(normal.is_normal_close());

        let abnormal = TransportEvent::Closed {
            code: Some(1011),
            reason: "internal".into(),
        };
        assert!(!abnormal.is_normal_close());

        let dropped = TransportEvent::Closed {
            code: None,
            reason: "eof".into(),
        };
        assert!(!dropped.is_normal_close());
        assert!(!TransportEvent::Opened.is_normal_close());
    }
}
