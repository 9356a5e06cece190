//! Constants for provider interactions
//!
//! String literals shared by the adapters, the router and the stream relay.

/// JSON field names in OpenAI-compatible bodies
pub mod json_fields {
    pub const MODEL: &str = "model";
    pub const STREAM: &str = "stream";
    pub const STREAM_OPTIONS: &str = "stream_options";
    pub const INCLUDE_USAGE: &str = "include_usage";
    pub const SYSTEM_FINGERPRINT: &str = "system_fingerprint";
    pub const USAGE: &str = "usage";
    pub const PROMPT_TOKENS: &str = "prompt_tokens";
    pub const COMPLETION_TOKENS: &str = "completion_tokens";
    pub const CHOICES: &str = "choices";
    pub const DELTA: &str = "delta";
    pub const CONTENT: &str = "content";
    pub const ERROR: &str = "error";
    pub const MESSAGE: &str = "message";
    pub const CODE: &str = "code";
}

/// Server-sent event framing
pub mod sse {
    pub const DATA_PREFIX: &str = "data:";
    pub const DONE: &str = "[DONE]";
    pub const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";
    pub const CONTENT_TYPE: &str = "text/event-stream";
    /// Upper bound on one buffered frame
    pub const MAX_FRAME_BYTES: usize = 1024 * 1024;
}

/// Upstream endpoints
pub mod urls {
    pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
}

/// Provider error codes with special handling
pub mod error_codes {
    pub const INVALID_API_KEY: &str = "invalid_api_key";
}
