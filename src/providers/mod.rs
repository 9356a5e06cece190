//! Provider abstraction for OpenAI-compatible upstream APIs
//!
//! An adapter knows how to turn a sanitized request into one upstream call and
//! how to classify what came back. Retrying, timeouts and streaming relay are
//! the router's business, not the adapter's.

pub mod constants;
pub mod openai;

use crate::domain::{GatewayRequest, ProviderKind, Route};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use constants::{error_codes, json_fields};

/// Model identity and usage reported by the provider
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseMetadata {
    pub model: Option<String>,
    pub system_fingerprint: Option<String>,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
}

impl ResponseMetadata {
    /// Pick whatever metadata fields a response body or stream chunk carries
    pub fn from_json(value: &Value) -> Self {
        let text = |field: &str| {
            value
                .get(field)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let usage = value.get(json_fields::USAGE).filter(|u| u.is_object());
        let count = |field: &str| usage.and_then(|u| u.get(field)).and_then(Value::as_u64);
        Self {
            model: text(json_fields::MODEL),
            system_fingerprint: text(json_fields::SYSTEM_FINGERPRINT),
            prompt_tokens: count(json_fields::PROMPT_TOKENS),
            completion_tokens: count(json_fields::COMPLETION_TOKENS),
        }
    }

    /// Fill fields that are still unknown; later chunks win for usage
    pub fn merge(&mut self, other: Self) {
        if self.model.is_none() {
            self.model = other.model;
        }
        if self.system_fingerprint.is_none() {
            self.system_fingerprint = other.system_fingerprint;
        }
        if other.prompt_tokens.is_some() {
            self.prompt_tokens = other.prompt_tokens;
        }
        if other.completion_tokens.is_some() {
            self.completion_tokens = other.completion_tokens;
        }
    }
}

/// A fully buffered 2xx response
#[derive(Debug, Clone)]
pub struct BufferedResponse {
    pub status: u16,
    pub body: Bytes,
    pub metadata: ResponseMetadata,
}

/// An open 2xx event stream, raw bytes as the provider sent them
pub struct StreamingResponse {
    pub status: u16,
    pub body: BoxStream<'static, Result<Bytes, ProviderError>>,
}

impl std::fmt::Debug for StreamingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Provider-specific error type
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Authentication error ({status:?}): {message}")]
    Auth {
        status: Option<u16>,
        message: String,
    },

    #[error("Provider returned {status}: {message}")]
    Status {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("No adapter registered for provider {0}")]
    Unsupported(&'static str),
}

/// How the retry loop treats a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Terminal, never retried
    Auth,
    /// No HTTP status attached; always retryable
    Network,
    /// Retryable iff the status is in the route's `retry_on` set
    Status(u16),
    /// Not an upstream condition that a retry could change
    Fatal,
}

impl ProviderError {
    /// Classify an error status and body from an OpenAI-compatible API
    pub fn from_status(status: u16, body: &[u8]) -> Self {
        let error = serde_json::from_slice::<Value>(body)
            .ok()
            .and_then(|value| value.get(json_fields::ERROR).cloned());
        let code = error
            .as_ref()
            .and_then(|e| e.get(json_fields::CODE))
            .and_then(Value::as_str)
            .map(str::to_string);
        let message = error
            .as_ref()
            .and_then(|e| e.get(json_fields::MESSAGE))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| String::from_utf8_lossy(body).chars().take(512).collect());

        if status == 401 || code.as_deref() == Some(error_codes::INVALID_API_KEY) {
            return Self::Auth {
                status: Some(status),
                message,
            };
        }
        Self::Status {
            status,
            code,
            message,
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            Self::Auth { .. } => FailureClass::Auth,
            Self::Network(_) | Self::Timeout(_) => FailureClass::Network,
            Self::Status { status, .. } => FailureClass::Status(*status),
            Self::InvalidResponse(_) | Self::Unsupported(_) => FailureClass::Fatal,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Auth { status, .. } => *status,
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Core adapter trait for OpenAI-compatible providers
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// One buffered attempt
    async fn send(
        &self,
        route: &Route,
        request: &GatewayRequest,
    ) -> Result<BufferedResponse, ProviderError>;

    /// One streaming attempt; errors before the first byte are classified
    /// exactly like buffered ones
    async fn open_stream(
        &self,
        route: &Route,
        request: &GatewayRequest,
    ) -> Result<StreamingResponse, ProviderError>;
}

/// Registry of adapters by provider type
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    adapters: HashMap<ProviderKind, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Both provider types served by the OpenAI-compatible adapter
    pub fn with_defaults(client: reqwest::Client) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(openai::OpenAiAdapter::new(
            ProviderKind::Openai,
            client.clone(),
        )));
        registry.register(Arc::new(openai::OpenAiAdapter::new(
            ProviderKind::OpenaiCompatible,
            client,
        )));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    pub fn adapter(&self, kind: ProviderKind) -> Result<Arc<dyn ProviderAdapter>, ProviderError> {
        self.adapters
            .get(&kind)
            .cloned()
            .ok_or(ProviderError::Unsupported(kind.as_str()))
    }
}
