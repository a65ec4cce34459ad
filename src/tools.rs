//! Tools the model may invoke during a conversation
//!
//! There is one tool, `recommendProduct`, which shows a product card to the
//! user. Live calls must answer every handled call with a `toolResponse`
//! correlated by the call id; each id is answered at most once.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::live::protocol::{ClientMessage, FunctionCall};

/// Name of the product recommendation tool
pub const RECOMMEND_PRODUCT: &str = "recommendProduct";

/// Rating used when the model gives none (or zero)
pub const DEFAULT_RATING: f64 = 4.5;

/// Acknowledgment returned to the live stream after a product is shown
pub const LIVE_TOOL_ACK: &str = "Product displayed";

/// Errors that can occur while handling a tool call
#[derive(Debug, Clone, PartialEq)]
pub enum ToolInvocationError {
    /// The model named a tool we don't provide
    UnknownTool(String),
    /// Arguments missing or of the wrong type
    InvalidArguments(String),
    /// This call id already received a response
    AlreadyAnswered(String),
}

impl std::fmt::Display for ToolInvocationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolInvocationError::UnknownTool(name) => write!(f, "Unknown tool: {}", name),
            ToolInvocationError::InvalidArguments(e) => write!(f, "Invalid tool arguments: {}", e),
            ToolInvocationError::AlreadyAnswered(id) => {
                write!(f, "Tool call {} was already answered", id)
            }
        }
    }
}

impl std::error::Error for ToolInvocationError {}

/// Function declarations advertised to the model
pub fn function_declarations() -> Vec<Value> {
    vec![json!({
        "name": RECOMMEND_PRODUCT,
        "parameters": {
            "type": "OBJECT",
            "description": "Recommend an Amazon product to the user.",
            "properties": {
                "name": { "type": "STRING", "description": "Name of the product" },
                "price": { "type": "STRING", "description": "Price of the product" },
                "description": { "type": "STRING", "description": "Short catchy description" },
                "rating": { "type": "NUMBER", "description": "Star rating (1-5)" }
            },
            "required": ["name", "price", "description"]
        }
    })]
}

/// A product the model asked to show
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductRecommendation {
    pub id: String,
    pub name: String,
    pub price: String,
    pub description: String,
    pub image_url: String,
    pub rating: f64,
}

fn required_str(args: &Value, key: &str) -> Result<String, ToolInvocationError> {
    match args.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(other) => Err(ToolInvocationError::InvalidArguments(format!(
            "'{}' must be a string, got {}",
            key, other
        ))),
        None => Err(ToolInvocationError::InvalidArguments(format!(
            "missing '{}'",
            key
        ))),
    }
}

impl ProductRecommendation {
    /// Build from `recommendProduct` arguments
    ///
    /// `rating` falls back to 4.5 when absent, null, zero or not a number.
    pub fn from_args(args: &Value) -> Result<Self, ToolInvocationError> {
        let name = required_str(args, "name")?;
        let price = required_str(args, "price")?;
        let description = required_str(args, "description")?;

        let rating = args
            .get("rating")
            .and_then(Value::as_f64)
            .filter(|r| *r != 0.0 && r.is_finite())
            .unwrap_or(DEFAULT_RATING);

        let id = Uuid::new_v4();
        let image_url = format!(
            "https://picsum.photos/200?random={}",
            id.as_u128() % 1000
        );

        Ok(Self {
            id: id.simple().to_string()[..9].to_string(),
            name,
            price,
            description,
            image_url,
            rating,
        })
    }
}

/// Where recommended products are shown
pub trait ProductDisplay: Send + Sync {
    /// Show a product; returns the acknowledgment for the model
    fn show_product(&self, product: &ProductRecommendation) -> String;
}

/// Handles tool calls for one live session
///
/// Tracks answered ids so each call gets at most one response.
pub struct ToolDispatcher {
    display: Arc<dyn ProductDisplay>,
    answered: HashSet<String>,
}

impl ToolDispatcher {
    pub fn new(display: Arc<dyn ProductDisplay>) -> Self {
        Self {
            display,
            answered: HashSet::new(),
        }
    }

    /// Invoke the tool and build the response to send back
    ///
    /// The product is shown exactly once per call id.
    pub fn invoke(&mut self, call: &FunctionCall) -> Result<ClientMessage, ToolInvocationError> {
        if call.name != RECOMMEND_PRODUCT {
            return Err(ToolInvocationError::UnknownTool(call.name.clone()));
        }
        if self.answered.contains(&call.id) {
            return Err(ToolInvocationError::AlreadyAnswered(call.id.clone()));
        }

        let response = match ProductRecommendation::from_args(&call.args) {
            Ok(product) => {
                let ack = self.display.show_product(&product);
                log::info!("Displayed product '{}' ({})", product.name, ack);
                json!({ "result": LIVE_TOOL_ACK })
            }
            Err(e) => {
                // Still answered, so the model isn't left waiting on this id
                log::warn!("Rejecting tool call {}: {}", call.id, e);
                json!({ "error": e.to_string() })
            }
        };

        self.answered.insert(call.id.clone());
        Ok(ClientMessage::tool_response(&call.id, &call.name, response))
    }

    pub fn answered_count(&self) -> usize {
        self.answered.len()
    }
}
