//! Request path of the gateway
//!
//! The axum edge hands each call to the [`RequestPipeline`], which runs the
//! policy decision, the per-route cache, the provider router and the stream
//! relay, then settles the ledger and records one telemetry event.

pub mod cache;
pub mod context;
pub mod error_response;
pub mod headers;
pub mod middleware;
pub mod pipeline;
pub mod router;
pub mod service;
pub mod streaming;

pub use cache::{build_cache_key, CacheRegistry, CachedResponse, ResponseCache};
pub use context::GatewayContext;
pub use pipeline::{GatewayError, InboundRequest, PipelineResponse, RequestPipeline};
pub use router::{ProviderRouter, RouterError};
pub use service::{GatewayService, ProxyError, DEFAULT_MAX_BODY_BYTES};
