//! Text chat with the Sales Boss persona
//!
//! Each message is a single-turn `generateContent` request carrying the
//! persona and the `recommendProduct` tool. Tool calls in the reply are shown
//! through the same `ProductDisplay` the live call uses.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::OnceLock;
use std::time::Duration;

use crate::live::protocol::{Content, FunctionCall};
use crate::persona::{SYSTEM_INSTRUCTION, TEXT_FALLBACK_REPLY};
use crate::tools::{function_declarations, ProductDisplay, ProductRecommendation, RECOMMEND_PRODUCT};

/// REST base for the Gemini API
pub const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Default model for text chat
pub const DEFAULT_CHAT_MODEL: &str = "gemini-3-flash-preview";

/// Global HTTP client for reuse across requests (avoids TLS handshake overhead)
static HTTP_CLIENT: OnceLock<Client> = OnceLock::new();

fn get_http_client() -> &'static Client {
    HTTP_CLIENT.get_or_init(|| {
        Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("Failed to build HTTP client")
    })
}

/// Errors that can occur during a text exchange
#[derive(Debug)]
pub enum ChatError {
    /// Gemini API key not configured
    MissingApiKey,
    /// Network/HTTP error
    Network(String),
    /// Gemini API returned an error
    Api { status: u16, message: String },
    /// Failed to parse API response
    Parse(String),
}

impl std::fmt::Display for ChatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatError::MissingApiKey => write!(
                f,
                "Gemini API key not configured. Set GEMINI_API_KEY environment variable."
            ),
            ChatError::Network(e) => write!(f, "Network error: {}", e),
            ChatError::Api { status, message } => {
                write!(f, "Gemini API error ({}): {}", status, message)
            }
            ChatError::Parse(e) => write!(f, "Failed to parse API response: {}", e),
        }
    }
}

impl std::error::Error for ChatError {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    system_instruction: Content,
    contents: Vec<Content>,
    tools: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    function_call: Option<FunctionCall>,
}

/// API error response
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Text and tool calls extracted from a response
#[derive(Debug, Default, PartialEq)]
struct ParsedReply {
    text: Option<String>,
    calls: Vec<FunctionCall>,
}

fn parse_reply(body: &str) -> Result<ParsedReply, ChatError> {
    let response: GenerateResponse =
        serde_json::from_str(body).map_err(|e| ChatError::Parse(e.to_string()))?;

    let mut texts = Vec::new();
    let mut calls = Vec::new();
    let parts = response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|c| c.parts)
        .unwrap_or_default();

    for part in parts {
        if let Some(text) = part.text {
            texts.push(text);
        }
        if let Some(call) = part.function_call {
            calls.push(call);
        }
    }

    let text = texts.concat();
    Ok(ParsedReply {
        text: if text.trim().is_empty() { None } else { Some(text) },
        calls,
    })
}

/// The model's answer to one message
#[derive(Debug, Clone, PartialEq)]
pub struct ChatReply {
    pub text: String,
    pub products: Vec<ProductRecommendation>,
}

/// One-shot text chat client
pub struct ChatClient {
    api_key: String,
    model: String,
}

impl ChatClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self, ChatError> {
        let api_key = api_key.into();
        if api_key.is_empty() {
            return Err(ChatError::MissingApiKey);
        }
        Ok(Self {
            api_key,
            model: model.into(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", GEMINI_API_BASE, self.model)
    }

    /// Send one message; recommended products go to `display`
    pub async fn send(
        &self,
        message: &str,
        display: &dyn ProductDisplay,
    ) -> Result<ChatReply, ChatError> {
        let request = GenerateRequest {
            system_instruction: Content::text(SYSTEM_INSTRUCTION),
            contents: vec![Content {
                role: Some("user".to_string()),
                ..Content::text(message)
            }],
            tools: vec![serde_json::json!({ "functionDeclarations": function_declarations() })],
        };

        log::info!("Sending chat message ({} chars) to {}", message.len(), self.model);

        let response = get_http_client()
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| ChatError::Network(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ChatError::Network(e.to_string()))?;

        if !status.is_success() {
            let message = match serde_json::from_str::<ApiErrorResponse>(&body) {
                Ok(error_response) => error_response.error.message,
                Err(_) => body,
            };
            log::error!("Gemini API error ({}): {}", status.as_u16(), message);
            return Err(ChatError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed = parse_reply(&body)?;
        Ok(apply_reply(parsed, display))
    }
}

fn apply_reply(parsed: ParsedReply, display: &dyn ProductDisplay) -> ChatReply {
    let mut products = Vec::new();
    for call in &parsed.calls {
        if call.name != RECOMMEND_PRODUCT {
            log::warn!("Ignoring unknown tool in chat reply: {}", call.name);
            continue;
        }
        match ProductRecommendation::from_args(&call.args) {
            Ok(product) => {
                display.show_product(&product);
                products.push(product);
            }
            Err(e) => log::warn!("Ignoring chat tool call: {}", e),
        }
    }

    ChatReply {
        text: parsed
            .text
            .unwrap_or_else(|| TEXT_FALLBACK_REPLY.to_string()),
        products,
    }
}
