//! Middleware for the gateway edge

use crate::domain::{duration_ms, RequestId};
use crate::proxy::headers::X_REQUEST_ID;
use axum::{
    extract::Request,
    http::HeaderValue,
    middleware::{from_fn, Next},
    response::Response,
    Router,
};
use std::time::Instant;
use tracing::info;

/// Ensures every request carries a UUID request id, propagating a valid
/// inbound one and minting a v7 id otherwise. The id is echoed on the response.
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|h| h.to_str().ok())
        .and_then(RequestId::parse)
        .unwrap_or_else(RequestId::generate);

    let header_value = HeaderValue::from_str(&request_id.to_string()).ok();
    if let Some(value) = &header_value {
        request.headers_mut().insert(X_REQUEST_ID, value.clone());
    }
    request.extensions_mut().insert(request_id);

    let mut response = next.run(request).await;
    if let Some(value) = header_value {
        response.headers_mut().insert(X_REQUEST_ID, value);
    }
    response
}

/// Logs request/response details with timing
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .map(ToString::to_string)
        .unwrap_or_else(|| "unknown".to_string());

    let response = next.run(request).await;

    info!(
        request_id = request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        duration_ms = duration_ms(start.elapsed()),
        "Request completed"
    );
    response
}

/// Apply the edge middleware; request id is outermost so logs can carry it
pub fn apply_middleware<S>(router: Router<S>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router
        .layer(from_fn(logging_middleware))
        .layer(from_fn(request_id_middleware))
}
