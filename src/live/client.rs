//! Gemini Live WebSocket client
//!
//! # Connection Flow
//!
//! 1. Connect to the BidiGenerateContent endpoint (API key in the query)
//! 2. Send `setup` before anything else
//! 3. Reader task reports `setupComplete` as `TransportEvent::Opened`
//! 4. Writer task drains the outbound queue until it is dropped, then closes
//!
//! No retries and no handshake timeout: a failed connect fails the call.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async_with_config, tungstenite::Message};

use super::protocol::{ClientMessage, ServerMessage, LIVE_API_URL};
use super::{LiveConnector, LiveLink, TransportError, TransportEvent};

/// Capacity of the inbound event channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Connector for the hosted Gemini Live service
#[derive(Clone)]
pub struct GeminiConnector {
    api_key: Option<String>,
    endpoint: String,
}

impl GeminiConnector {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()).filter(|k| !k.is_empty()),
            endpoint: LIVE_API_URL.to_string(),
        }
    }

    /// Key from `GEMINI_API_KEY`; without one every connect fails with `MissingApiKey`
    pub fn from_env() -> Self {
        Self {
            api_key: get_api_key(),
            endpoint: LIVE_API_URL.to_string(),
        }
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Use a different endpoint (e.g. a local proxy)
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn url(&self) -> Option<String> {
        self.api_key
            .as_ref()
            .map(|key| format!("{}?key={}", self.endpoint, key))
    }
}

impl std::fmt::Debug for GeminiConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiConnector")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl LiveConnector for GeminiConnector {
    fn connect(&self, setup: ClientMessage) -> BoxFuture<'static, Result<LiveLink, TransportError>> {
        let url = self.url();
        let endpoint = self.endpoint.clone();
        Box::pin(async move {
            let url = url.ok_or(TransportError::MissingApiKey)?;
            open_link(&url, &endpoint, setup).await
        })
    }
}

/// Parse one inbound frame into an event
fn parse_frame(payload: &[u8]) -> Result<TransportEvent, TransportError> {
    let msg: ServerMessage =
        serde_json::from_slice(payload).map_err(|e| TransportError::ProtocolError(e.to_string()))?;
    if msg.is_setup_complete() {
        Ok(TransportEvent::Opened)
    } else {
        Ok(TransportEvent::Message(msg))
    }
}

async fn open_link(
    url: &str,
    endpoint: &str,
    setup: ClientMessage,
) -> Result<LiveLink, TransportError> {
    log::info!("Connecting to Gemini Live API at {}...", endpoint);

    let (ws_stream, _response) = connect_async_with_config(url, None, true)
        .await
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

    let (mut write, mut read) = ws_stream.split();

    let setup_json =
        serde_json::to_string(&setup).map_err(|e| TransportError::ProtocolError(e.to_string()))?;
    write
        .send(Message::Text(setup_json))
        .await
        .map_err(|e| TransportError::SendFailed(e.to_string()))?;

    log::info!("WebSocket connected, setup sent");

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientMessage>();
    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

    let writer_events = events_tx.clone();
    let writer_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    log::warn!("Failed to serialize {}: {}", msg.kind(), e);
                    continue;
                }
            };
            if let Err(e) = write.send(Message::Text(json)).await {
                log::warn!("Failed to send {}: {}", msg.kind(), e);
                let _ = writer_events
                    .send(TransportEvent::Error(
                        TransportError::SendFailed(e.to_string()).to_string(),
                    ))
                    .await;
                return;
            }
        }

        // Outbound queue dropped: end the conversation cleanly
        if let Err(e) = write.close().await {
            log::debug!("Error closing WebSocket: {}", e);
        }
        log::debug!("Writer task exiting");
    });

    let reader_task = tokio::spawn(async move {
        let final_event = loop {
            let event = match read.next().await {
                Some(Ok(Message::Text(text))) => parse_frame(text.as_bytes()),
                Some(Ok(Message::Binary(bytes))) => parse_frame(&bytes),
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(f) => (Some(u16::from(f.code)), f.reason.to_string()),
                        None => (None, String::new()),
                    };
                    log::info!("WebSocket closed by server (code {:?}) {}", code, reason);
                    break TransportEvent::Closed { code, reason };
                }
                Some(Ok(_)) => continue, // ping/pong/raw frames
                Some(Err(e)) => {
                    log::warn!("WebSocket error: {}", e);
                    break TransportEvent::Error(e.to_string());
                }
                None => {
                    break TransportEvent::Closed {
                        code: None,
                        reason: "stream ended".to_string(),
                    }
                }
            };

            match event {
                Ok(event) => {
                    if events_tx.send(event).await.is_err() {
                        log::debug!("Event channel closed");
                        return;
                    }
                }
                Err(e) => log::warn!("Failed to parse server message: {}", e),
            }
        };

        let _ = events_tx.send(final_event).await;
        log::debug!("Reader task exiting");
    });

    Ok(LiveLink {
        outbound: outbound_tx,
        events: events_rx,
        tasks: vec![writer_task, reader_task],
    })
}

/// Get the Gemini API key from environment
pub fn get_api_key() -> Option<String> {
    std::env::var("GEMINI_API_KEY")
        .or_else(|_| std::env::var("API_KEY"))
        .ok()
        .filter(|k| !k.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_api_key_does_not_panic() {
        let _ = get_api_key();
    }

    #[test]
    fn test_url_carries_key() {
        let connector = GeminiConnector::new("abc").with_endpoint("wss://localhost/live");
        assert_eq!(connector.url().as_deref(), Some("wss://localhost/live?key=abc"));
        assert!(!format!("{:?}", connector).contains("abc"));
    }

    #[tokio::test]
    async fn test_missing_key_fails_connect() {
        let connector = GeminiConnector::new("");
        assert!(!connector.has_api_key());
        let setup = ClientMessage::setup("m", "Puck", None, vec![]);
        let err = connector.connect(setup).await.err();
        assert_eq!(err, Some(TransportError::MissingApiKey));
    }

    #[test]
    fn test_parse_frame() {
        assert_eq!(
            parse_frame(br#"{"setupComplete":{}}"#).unwrap(),
            TransportEvent::Opened
        );

        match parse_frame(br#"{"serverContent":{"interrupted":true}}"#).unwrap() {
            TransportEvent::Message(msg) => assert!(msg.is_interrupted()),
            other => panic!("unexpected event {:?}", other),
        }

        assert!(matches!(
            parse_frame(b"not json"),
            Err(TransportError::ProtocolError(_))
        ));
    }

    #[tokio::test]
    #[ignore] // Requires valid API key
    async fn test_live_connection() {
        let api_key = get_api_key().expect("GEMINI_API_KEY required");
        let setup = ClientMessage::setup(super::super::protocol::DEFAULT_LIVE_MODEL, "Puck", None, vec![]);

        let mut link = GeminiConnector::new(api_key)
            .connect(setup)
            .await
            .expect("Connection failed");

        assert_eq!(link.events.recv().await, Some(TransportEvent::Opened));
        for task in link.tasks.drain(..) {
            task.abort();
        }
    }
}
