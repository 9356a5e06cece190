//! Inbound request model for the OpenAI-compatible endpoints

use crate::domain::gateway_config::EndpointType;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Body keys that carry content or routing rather than provider parameters
const CONTENT_KEYS: [&str; 4] = ["model", "messages", "input", "stream"];

/// One chat message, kept as the caller sent it.
///
/// Only the text (string `content`, or the `text` of typed content parts) is
/// visible to redaction and estimation. Every other field, such as
/// `tool_calls`, `tool_call_id` or `name`, is forwarded untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatMessage(Map<String, Value>);

impl ChatMessage {
    /// A plain text message
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert("role".to_string(), Value::String(role.into()));
        fields.insert("content".to_string(), Value::String(content.into()));
        Self(fields)
    }

    fn from_value(value: Value) -> Result<Self, String> {
        let Value::Object(fields) = value else {
            return Err("each message must be an object".to_string());
        };
        if !matches!(fields.get("role"), Some(Value::String(_))) {
            return Err("each message needs a string 'role'".to_string());
        }
        match fields.get("content") {
            None | Some(Value::Null) | Some(Value::String(_)) => {}
            Some(Value::Array(parts)) if parts.iter().all(Value::is_object) => {}
            Some(_) => {
                return Err("'content' must be a string, an array of parts or null".to_string())
            }
        }
        Ok(Self(fields))
    }

    fn texts(&self) -> Vec<&str> {
        match self.0.get("content") {
            Some(Value::String(text)) => vec![text.as_str()],
            Some(Value::Array(parts)) => parts.iter().filter_map(text_part).collect(),
            _ => Vec::new(),
        }
    }

    /// Replace the message's texts in order, leaving every other field alone
    fn with_texts(&self, texts: &mut impl Iterator<Item = String>) -> Self {
        let mut fields = self.0.clone();
        match fields.get_mut("content") {
            Some(content) if content.is_string() => {
                if let Some(text) = texts.next() {
                    *content = Value::String(text);
                }
            }
            Some(Value::Array(parts)) => {
                for part in parts.iter_mut() {
                    if text_part(part).is_none() {
                        continue;
                    }
                    if let (Some(text), Some(slot)) = (texts.next(), part.get_mut("text")) {
                        *slot = Value::String(text);
                    }
                }
            }
            _ => {}
        }
        Self(fields)
    }
}

/// The text of a `{"type": "text", "text": ...}` content part
fn text_part(part: &Value) -> Option<&str> {
    if part.get("type").and_then(Value::as_str) != Some("text") {
        return None;
    }
    part.get("text").and_then(Value::as_str)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EmbeddingInput {
    Single(String),
    Batch(Vec<String>),
}

/// The text content of a request, the only part redaction and token
/// estimation look at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestPayload {
    Chat { messages: Vec<ChatMessage> },
    Embeddings { input: EmbeddingInput },
}

impl RequestPayload {
    pub fn endpoint_type(&self) -> EndpointType {
        match self {
            Self::Chat { .. } => EndpointType::Chat,
            Self::Embeddings { .. } => EndpointType::Embeddings,
        }
    }

    fn segments(&self) -> Vec<&str> {
        match self {
            Self::Chat { messages } => messages.iter().flat_map(ChatMessage::texts).collect(),
            Self::Embeddings {
                input: EmbeddingInput::Single(text),
            } => vec![text.as_str()],
            Self::Embeddings {
                input: EmbeddingInput::Batch(texts),
            } => texts.iter().map(String::as_str).collect(),
        }
    }

    /// All content joined with newlines, as scanned by redaction and estimation
    pub fn candidate_text(&self) -> String {
        self.segments().join("\n")
    }

    /// Rebuild the payload from a scrubbed version of [`Self::candidate_text`].
    ///
    /// The scrubbed text is split on newlines and handed back positionally:
    /// each segment takes as many lines as it originally had, and the last
    /// segment absorbs whatever remains. Replacement tags never contain
    /// newlines, so the split only shifts when a match spanned a line break.
    pub fn with_scrubbed_text(&self, scrubbed: &str) -> Self {
        let line_counts: Vec<usize> = self
            .segments()
            .iter()
            .map(|segment| segment.split('\n').count())
            .collect();
        let mut lines = scrubbed.split('\n');
        let last = line_counts.len().saturating_sub(1);
        let rebuilt: Vec<String> = line_counts
            .iter()
            .enumerate()
            .map(|(index, count)| {
                if index == last {
                    lines.by_ref().collect::<Vec<_>>().join("\n")
                } else {
                    lines.by_ref().take(*count).collect::<Vec<_>>().join("\n")
                }
            })
            .collect();

        match self {
            Self::Chat { messages } => {
                let mut texts = rebuilt.into_iter();
                Self::Chat {
                    messages: messages
                        .iter()
                        .map(|message| message.with_texts(&mut texts))
                        .collect(),
                }
            }
            Self::Embeddings {
                input: EmbeddingInput::Single(_),
            } => Self::Embeddings {
                input: EmbeddingInput::Single(rebuilt.into_iter().next().unwrap_or_default()),
            },
            Self::Embeddings {
                input: EmbeddingInput::Batch(_),
            } => Self::Embeddings {
                input: EmbeddingInput::Batch(rebuilt),
            },
        }
    }

    /// The payload as the JSON fields an OpenAI-compatible body carries
    pub fn to_json_fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        match self {
            Self::Chat { messages } => {
                fields.insert(
                    "messages".to_string(),
                    serde_json::to_value(messages).unwrap_or(Value::Array(Vec::new())),
                );
            }
            Self::Embeddings { input } => {
                fields.insert(
                    "input".to_string(),
                    serde_json::to_value(input).unwrap_or(Value::Null),
                );
            }
        }
        fields
    }
}

/// A parsed inbound request, before any policy has touched it
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayRequest {
    pub payload: RequestPayload,
    pub params: Map<String, Value>,
    pub stream: bool,
}

/// Result of parsing an OpenAI-compatible body
#[derive(Debug, Clone)]
pub struct ParsedBody {
    /// The body's `model` field, used as the route name when no header names one
    pub model: Option<String>,
    pub request: GatewayRequest,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestParseError {
    #[error("request body is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("request body must be a JSON object")]
    NotAnObject,

    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("field '{field}' is malformed: {reason}")]
    MalformedField { field: &'static str, reason: String },
}

impl GatewayRequest {
    /// Split an OpenAI-compatible body into content, routing and parameters
    pub fn parse_body(endpoint: EndpointType, body: &[u8]) -> Result<ParsedBody, RequestParseError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| RequestParseError::InvalidJson(e.to_string()))?;
        let Value::Object(mut object) = value else {
            return Err(RequestParseError::NotAnObject);
        };

        let model = match object.get("model") {
            Some(Value::String(model)) => Some(model.clone()),
            Some(Value::Null) | None => None,
            Some(_) => {
                return Err(RequestParseError::MalformedField {
                    field: "model",
                    reason: "expected a string".to_string(),
                })
            }
        };

        let stream = match object.get("stream") {
            Some(Value::Bool(stream)) => *stream,
            Some(Value::Null) | None => false,
            Some(_) => {
                return Err(RequestParseError::MalformedField {
                    field: "stream",
                    reason: "expected a boolean".to_string(),
                })
            }
        };

        let payload = match endpoint {
            EndpointType::Chat => {
                let raw = object
                    .remove("messages")
                    .ok_or(RequestParseError::MissingField("messages"))?;
                let Value::Array(raw) = raw else {
                    return Err(RequestParseError::MalformedField {
                        field: "messages",
                        reason: "expected an array".to_string(),
                    });
                };
                let messages = raw
                    .into_iter()
                    .map(ChatMessage::from_value)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|reason| RequestParseError::MalformedField {
                        field: "messages",
                        reason,
                    })?;
                if messages.is_empty() {
                    return Err(RequestParseError::MalformedField {
                        field: "messages",
                        reason: "at least one message is required".to_string(),
                    });
                }
                RequestPayload::Chat { messages }
            }
            EndpointType::Embeddings => {
                let raw = object
                    .remove("input")
                    .ok_or(RequestParseError::MissingField("input"))?;
                let input: EmbeddingInput = serde_json::from_value(raw).map_err(|e| {
                    RequestParseError::MalformedField {
                        field: "input",
                        reason: e.to_string(),
                    }
                })?;
                RequestPayload::Embeddings { input }
            }
        };

        let params = object
            .into_iter()
            .filter(|(key, _)| !CONTENT_KEYS.contains(&key.as_str()))
            .collect();

        Ok(ParsedBody {
            model,
            request: GatewayRequest {
                payload,
                params,
                // Embeddings have no streaming form
                stream: stream && endpoint == EndpointType::Chat,
            },
        })
    }
}
