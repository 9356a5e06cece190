//! Parameter merging and allow-list validation
//!
//! Route defaults are merged under per-request overrides, output caps are
//! clamped to the route policy, and the result is checked against the
//! endpoint's allow-list. Unknown keys are rejected rather than forwarded.

use crate::domain::EndpointType;
use serde_json::{Map, Value};
use thiserror::Error;

/// Correlation keys clients may send; never forwarded upstream or hashed into cache keys
pub const VOLATILE_PARAM_KEYS: [&str; 3] = ["request_id", "trace_id", "client_request_id"];

/// Keys that bound the number of generated tokens
pub const OUTPUT_CAP_KEYS: [&str; 2] = ["max_tokens", "max_completion_tokens"];

const CHAT_PARAMS: &[&str] = &[
    "temperature",
    "top_p",
    "n",
    "stop",
    "max_tokens",
    "max_completion_tokens",
    "presence_penalty",
    "frequency_penalty",
    "logit_bias",
    "logprobs",
    "top_logprobs",
    "user",
    "seed",
    "response_format",
    "tools",
    "tool_choice",
    "parallel_tool_calls",
    "stream_options",
];

const EMBEDDING_PARAMS: &[&str] = &["encoding_format", "dimensions", "user"];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParamError {
    #[error("unsupported parameters: {}", .0.join(", "))]
    UnknownKeys(Vec<String>),

    #[error("parameter '{0}' must be a positive integer")]
    NotPositiveInteger(String),
}

impl ParamError {
    /// Names of the offending keys, for the error body and telemetry
    pub fn keys(&self) -> Vec<String> {
        match self {
            Self::UnknownKeys(keys) => keys.clone(),
            Self::NotPositiveInteger(key) => vec![key.clone()],
        }
    }
}

pub fn allowed_params(endpoint: EndpointType) -> &'static [&'static str] {
    match endpoint {
        EndpointType::Chat => CHAT_PARAMS,
        EndpointType::Embeddings => EMBEDDING_PARAMS,
    }
}

pub fn is_volatile(key: &str) -> bool {
    VOLATILE_PARAM_KEYS.contains(&key)
}

/// Merge defaults and overrides (request wins), strip volatile keys, clamp
/// output caps and validate the result.
pub fn merge_and_validate(
    endpoint: EndpointType,
    defaults: &Map<String, Value>,
    overrides: &Map<String, Value>,
    max_tokens_out: Option<u32>,
) -> Result<Map<String, Value>, ParamError> {
    let mut merged = defaults.clone();
    for (key, value) in overrides {
        merged.insert(key.clone(), value.clone());
    }
    merged.retain(|key, _| !is_volatile(key));

    let allowed = allowed_params(endpoint);
    let mut unknown: Vec<String> = merged
        .keys()
        .filter(|key| !allowed.contains(&key.as_str()))
        .cloned()
        .collect();
    if !unknown.is_empty() {
        unknown.sort();
        return Err(ParamError::UnknownKeys(unknown));
    }

    for key in OUTPUT_CAP_KEYS {
        let Some(value) = merged.get(key) else {
            continue;
        };
        let requested = match value.as_u64() {
            Some(n) if n > 0 => n,
            _ => return Err(ParamError::NotPositiveInteger(key.to_string())),
        };
        if let Some(cap) = max_tokens_out {
            if requested > u64::from(cap) {
                merged.insert(key.to_string(), Value::from(cap));
            }
        }
    }

    Ok(merged)
}

/// Smallest output cap the request carries after merging
pub fn requested_output_cap(params: &Map<String, Value>) -> Option<u64> {
    OUTPUT_CAP_KEYS
        .iter()
        .filter_map(|key| params.get(*key).and_then(Value::as_u64))
        .min()
}
