//! Axum edge of the gateway
//!
//! ## Service Lifecycle
//!
//! ```rust,ignore
//! use tollbooth::proxy::{GatewayService, RequestPipeline};
//!
//! let pipeline = RequestPipeline::new(context);
//! let router = GatewayService::new(pipeline, max_body_bytes).into_router();
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//! axum::serve(listener, router).await?;
//! ```
//!
//! Handlers only translate HTTP into an [`InboundRequest`] and a
//! [`PipelineResponse`] back into HTTP; all policy lives in the pipeline.

use crate::domain::{EndpointType, RequestId};
use crate::providers::constants::sse;
use crate::proxy::error_response::ErrorResponseExt;
use crate::proxy::headers::{
    bearer_token, paths, AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE, X_GATEWAY_CACHE,
    X_GATEWAY_ROUTE,
};
use crate::proxy::middleware::apply_middleware;
use crate::proxy::pipeline::{InboundRequest, PipelineResponse, RequestPipeline};
use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tower_http::limit::RequestBodyLimitLayer;

/// Largest inbound body accepted when the settings do not say otherwise
pub const DEFAULT_MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

const JSON_CONTENT_TYPE: &str = "application/json";

/// Failures of the HTTP edge itself, before a request reaches the pipeline
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProxyError {
    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("no handler for {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        self.to_error_response().into_response_with_status(status)
    }
}

pub struct GatewayService {
    pipeline: RequestPipeline,
    max_body_bytes: usize,
}

impl GatewayService {
    pub fn new(pipeline: RequestPipeline, max_body_bytes: usize) -> Self {
        Self {
            pipeline,
            max_body_bytes,
        }
    }

    /// Routes plus the edge middleware
    pub fn into_router(self) -> Router {
        let limit = self.max_body_bytes;
        let service = Arc::new(self);
        let router = Router::new()
            .route(paths::CHAT_COMPLETIONS, post(chat_completions))
            .route(paths::EMBEDDINGS, post(embeddings))
            .route(paths::HEALTH, get(health_handler))
            .fallback(not_found)
            .layer(RequestBodyLimitLayer::new(limit))
            .layer(middleware::from_fn_with_state(
                Arc::clone(&service),
                oversized_body_middleware,
            ))
            .with_state(service);
        apply_middleware(router)
    }

    async fn forward(
        &self,
        endpoint: EndpointType,
        request: Request,
    ) -> Result<Response, ProxyError> {
        let (request_id, token, route_hint) = caller_hints(&request);
        let body = axum::body::to_bytes(request.into_body(), self.max_body_bytes)
            .await
            .map_err(|_| ProxyError::PayloadTooLarge {
                limit: self.max_body_bytes,
            })?;

        let outcome = self
            .pipeline
            .handle(InboundRequest {
                request_id,
                token,
                route_hint,
                endpoint,
                body,
            })
            .await;
        render(outcome, request_id)
    }
}

/// Request id, bearer token and route header of an inbound call
fn caller_hints(request: &Request) -> (Option<RequestId>, Option<String>, Option<String>) {
    let request_id = request.extensions().get::<RequestId>().copied();
    let token = header_str(request.headers(), AUTHORIZATION.as_str())
        .and_then(bearer_token)
        .map(str::to_string);
    let route_hint = header_str(request.headers(), X_GATEWAY_ROUTE)
        .map(str::trim)
        .filter(|route| !route.is_empty())
        .map(str::to_string);
    (request_id, token, route_hint)
}

/// Bodies over the limit are refused before a handler sees them, either by
/// the limit layer or while buffering; both still leave one telemetry event.
async fn oversized_body_middleware(
    State(service): State<Arc<GatewayService>>,
    request: Request,
    next: Next,
) -> Response {
    let gateway_call = matches!(
        request.uri().path(),
        paths::CHAT_COMPLETIONS | paths::EMBEDDINGS
    );
    let (request_id, token, route_hint) = caller_hints(&request);

    let response = next.run(request).await;
    if !gateway_call || response.status() != StatusCode::PAYLOAD_TOO_LARGE {
        return response;
    }

    let limit = service.max_body_bytes;
    service
        .pipeline
        .record_oversized(request_id, token.as_deref(), route_hint, limit);
    ProxyError::PayloadTooLarge { limit }.into_response()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn status_of(status: u16) -> StatusCode {
    StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY)
}

fn render(outcome: PipelineResponse, request_id: Option<RequestId>) -> Result<Response, ProxyError> {
    let response = match outcome {
        PipelineResponse::Buffered {
            status,
            body,
            cache_hit,
        } => Response::builder()
            .status(status_of(status))
            .header(CONTENT_TYPE, JSON_CONTENT_TYPE)
            .header(X_GATEWAY_CACHE, if cache_hit { "hit" } else { "miss" })
            .body(Body::from(body)),
        PipelineResponse::Streaming { status, body } => Response::builder()
            .status(status_of(status))
            .header(CONTENT_TYPE, sse::CONTENT_TYPE)
            .header(CACHE_CONTROL, "no-cache")
            .body(Body::from_stream(body)),
        PipelineResponse::Rejected(error) => {
            let mut rendered = error.to_error_response();
            if let Some(id) = request_id {
                rendered = rendered.with_request_id(id.to_string());
            }
            return Ok(rendered.into_response_with_status(error.status_code()));
        }
    };
    response.map_err(|err| ProxyError::Internal(err.to_string()))
}

async fn chat_completions(
    State(service): State<Arc<GatewayService>>,
    request: Request,
) -> Result<Response, ProxyError> {
    service.forward(EndpointType::Chat, request).await
}

async fn embeddings(
    State(service): State<Arc<GatewayService>>,
    request: Request,
) -> Result<Response, ProxyError> {
    service.forward(EndpointType::Embeddings, request).await
}

async fn health_handler(State(service): State<Arc<GatewayService>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "config_checksum": service.pipeline.context().checksum(),
    }))
}

async fn not_found(request: Request) -> ProxyError {
    ProxyError::NotFound(format!("{} {}", request.method(), request.uri().path()))
}
