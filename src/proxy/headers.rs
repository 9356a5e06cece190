//! HTTP header names and well-known paths of the gateway edge

/// Header name for request ID used for tracing and correlation
pub const X_REQUEST_ID: &str = "x-request-id";

/// Names the route explicitly; the body's `model` field is the fallback
pub const X_GATEWAY_ROUTE: &str = "x-gateway-route";

/// Set on buffered replies served from the response cache
pub const X_GATEWAY_CACHE: &str = "x-gateway-cache";

/// Authorization header prefix for bearer tokens
pub const BEARER_PREFIX: &str = "Bearer ";

pub use ::http::header::{AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE};

/// Well-known paths
pub mod paths {
    pub const CHAT_COMPLETIONS: &str = "/v1/chat/completions";
    pub const EMBEDDINGS: &str = "/v1/embeddings";
    pub const HEALTH: &str = "/health";
}

/// The bearer token of an `Authorization` value, if it is one
pub fn bearer_token(value: &str) -> Option<&str> {
    value
        .strip_prefix(BEARER_PREFIX)
        .map(str::trim)
        .filter(|token| !token.is_empty())
}
