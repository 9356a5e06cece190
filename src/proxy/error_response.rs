//! OpenAI-compatible error bodies
//!
//! Every refusal the gateway produces, whether a policy block, an upstream
//! failure or an edge problem, is rendered as
//! `{"error": {"message", "type", "code"}}` with the request id echoed in the
//! response headers.

use crate::policy::BlockMeta;
use crate::proxy::headers::X_REQUEST_ID;
use crate::proxy::pipeline::GatewayError;
use crate::proxy::service::ProxyError;
use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Budget snapshots and offending keys, where a block carries them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<BlockMeta>,
}

/// Standard error response format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
    #[serde(skip)]
    pub request_id: Option<String>,
}

impl ErrorResponse {
    pub fn new(
        error_type: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            error: ErrorBody {
                message: message.into(),
                error_type: error_type.into(),
                code: Some(code.into()),
                meta: None,
            },
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_meta(mut self, meta: Option<BlockMeta>) -> Self {
        self.error.meta = meta;
        self
    }

    /// Convert to HTTP response with the request id header
    pub fn into_response_with_status(self, status: StatusCode) -> Response {
        let request_id = self.request_id.clone();
        let mut response = (status, Json(self)).into_response();

        if let Some(id) = request_id {
            if let Ok(header_value) = HeaderValue::from_str(&id) {
                response.headers_mut().insert(X_REQUEST_ID, header_value);
            }
        }

        response
    }
}

/// Extension trait for consistent error formatting
pub trait ErrorResponseExt {
    fn to_error_response(&self) -> ErrorResponse;

    fn status_code(&self) -> StatusCode;
}

impl ErrorResponseExt for GatewayError {
    fn to_error_response(&self) -> ErrorResponse {
        ErrorResponse::new(
            self.reason.error_type(),
            self.reason.error_code(),
            self.message.clone(),
        )
        .with_meta(self.meta.clone())
    }

    fn status_code(&self) -> StatusCode {
        self.reason.status_code()
    }
}

impl ErrorResponseExt for ProxyError {
    fn to_error_response(&self) -> ErrorResponse {
        match self {
            ProxyError::PayloadTooLarge { .. } => {
                ErrorResponse::new("invalid_request_error", "payload_too_large", self.to_string())
            }
            ProxyError::NotFound(_) => {
                ErrorResponse::new("invalid_request_error", "not_found", self.to_string())
            }
            ProxyError::Internal(_) => {
                ErrorResponse::new("server_error", "internal_error", self.to_string())
            }
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::NotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Helper to extract request ID from headers
pub fn extract_request_id(headers: &http::HeaderMap) -> Option<String> {
    headers
        .get(X_REQUEST_ID)
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string())
}
