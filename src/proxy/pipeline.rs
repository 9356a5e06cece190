//! Request pipeline
//!
//! evaluate → cache → provider router → drift → settle → telemetry/webhooks.
//! Every branch out of [`RequestPipeline::handle`] records exactly one
//! telemetry event: before returning for buffered replies, and from the
//! relay's completion hook (before the terminator frame) for streams.

use crate::domain::{
    duration_ms, EndpointType, GatewayRequest, MicroUsd, RequestId, RouteName, WebhookEventType,
};
use crate::policy::{
    AllowedRequest, Attribution, BlockMeta, BlockReason, BlockedRequest, DriftObservation,
    DriftVerdict, PolicyDecision, PolicyEvaluator,
};
use crate::providers::ResponseMetadata;
use crate::proxy::cache::{build_cache_key, CachedResponse};
use crate::proxy::context::GatewayContext;
use crate::proxy::router::{ProviderRouter, RouterError};
use crate::proxy::streaming::{relay, RelayBody, StreamSummary};
use crate::telemetry::{TelemetryEvent, TelemetryOutcome, WebhookPayload};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};

/// An inbound call as the HTTP edge hands it over
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub request_id: Option<RequestId>,
    /// Bearer token, if the caller sent one
    pub token: Option<String>,
    /// Route named by header; the body's `model` is the fallback
    pub route_hint: Option<String>,
    pub endpoint: EndpointType,
    pub body: Bytes,
}

/// A refusal, rendered as an OpenAI-style error body by the edge
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayError {
    pub reason: BlockReason,
    pub message: String,
    pub meta: Option<BlockMeta>,
}

impl From<&BlockedRequest> for GatewayError {
    fn from(block: &BlockedRequest) -> Self {
        Self {
            reason: block.reason,
            message: block.message.clone(),
            meta: block.meta.clone(),
        }
    }
}

pub enum PipelineResponse {
    Buffered {
        status: u16,
        body: Bytes,
        cache_hit: bool,
    },
    Streaming {
        status: u16,
        body: RelayBody,
    },
    Rejected(GatewayError),
}

impl std::fmt::Debug for PipelineResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buffered {
                status, cache_hit, ..
            } => f
                .debug_struct("Buffered")
                .field("status", status)
                .field("cache_hit", cache_hit)
                .finish_non_exhaustive(),
            Self::Streaming { status, .. } => f
                .debug_struct("Streaming")
                .field("status", status)
                .finish_non_exhaustive(),
            Self::Rejected(error) => f.debug_tuple("Rejected").field(error).finish(),
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    duration_ms(started.elapsed())
}

#[derive(Clone)]
pub struct RequestPipeline {
    ctx: Arc<GatewayContext>,
    evaluator: PolicyEvaluator,
    router: ProviderRouter,
}

impl RequestPipeline {
    pub fn new(ctx: Arc<GatewayContext>) -> Self {
        let evaluator = PolicyEvaluator::new(
            Arc::clone(&ctx.catalog),
            Arc::clone(&ctx.ledger),
            Arc::clone(&ctx.pricing),
        );
        let router = ProviderRouter::new(Arc::clone(&ctx.providers));
        Self {
            ctx,
            evaluator,
            router,
        }
    }

    pub fn context(&self) -> &Arc<GatewayContext> {
        &self.ctx
    }

    #[instrument(skip_all, fields(request_id = ?inbound.request_id, endpoint = inbound.endpoint.as_str()))]
    pub async fn handle(&self, inbound: InboundRequest) -> PipelineResponse {
        let started = Instant::now();
        let request_id = inbound.request_id;

        let parsed = match GatewayRequest::parse_body(inbound.endpoint, &inbound.body) {
            Ok(parsed) => parsed,
            Err(err) => {
                let block = self.unparseable(inbound.token.as_deref(), inbound.route_hint, &err.to_string());
                return self.reject(block, request_id, started);
            }
        };

        let route_name = inbound.route_hint.or(parsed.model).unwrap_or_default();
        match self
            .evaluator
            .evaluate(inbound.token.as_deref(), &route_name, parsed.request)
        {
            PolicyDecision::Blocked(block) => self.reject(block, request_id, started),
            PolicyDecision::Allowed(allowed) => self.dispatch(*allowed, request_id, started).await,
        }
    }

    /// Record a body the HTTP edge refused for exceeding `limit` bytes
    pub fn record_oversized(
        &self,
        request_id: Option<RequestId>,
        token: Option<&str>,
        route_hint: Option<String>,
        limit: usize,
    ) {
        let detail = format!("request body exceeds {limit} bytes");
        let block = self.unparseable(token, route_hint, &detail);
        self.reject(block, request_id, Instant::now());
    }

    /// A body that failed to parse; an unknown caller still hears `unauthorized`
    fn unparseable(&self, token: Option<&str>, route_hint: Option<String>, detail: &str) -> BlockedRequest {
        let route = route_hint.and_then(|name| RouteName::try_new(name).ok());
        match token.and_then(|token| self.ctx.catalog.resolve_caller(token)) {
            None => BlockedRequest::new(
                BlockReason::Unauthorized,
                "missing or unknown service token",
                Attribution::default(),
            ),
            Some(caller) => BlockedRequest::new(
                BlockReason::InvalidBody,
                detail,
                Attribution {
                    tenant: Some(caller.tenant.clone()),
                    route,
                    service: Some(caller.service_label.clone()),
                },
            ),
        }
    }

    fn reject(
        &self,
        block: BlockedRequest,
        request_id: Option<RequestId>,
        started: Instant,
    ) -> PipelineResponse {
        let mut event = TelemetryEvent::blocked(
            block.reason,
            block.meta.clone(),
            &block.attribution,
            self.ctx.checksum(),
        )
        .with_request_id(request_id);
        if let Some(tenant) = &block.attribution.tenant {
            let spend = self.ctx.ledger.tenant_spend(tenant).to_usd();
            event.budget_before_usd = spend;
            event.budget_after_usd = spend;
        }
        event.latency_ms = elapsed_ms(started);

        info!(reason = %block.reason, route = ?block.attribution.route, "Request blocked");
        publish(
            &self.ctx,
            event,
            WebhookEventType::RequestBlocked,
            block.excerpt_source.as_deref(),
        );
        PipelineResponse::Rejected(GatewayError::from(&block))
    }

    async fn dispatch(
        &self,
        allowed: AllowedRequest,
        request_id: Option<RequestId>,
        started: Instant,
    ) -> PipelineResponse {
        let route = &allowed.route.route;
        let mut cache_key = None;
        if !allowed.request.stream {
            if let Some(settings) = route.cache_settings() {
                let key = build_cache_key(route, &allowed.request, settings.include_params);
                if let Some(hit) = self.ctx.caches.get(route, &key) {
                    return self.serve_cached(&allowed, hit, request_id, started);
                }
                cache_key = Some(key);
            }
        }

        if allowed.request.stream {
            self.stream(allowed, request_id, started).await
        } else {
            self.buffered(allowed, cache_key, request_id, started).await
        }
    }

    /// A hit settles the reservation at zero and replays the stored bytes
    fn serve_cached(
        &self,
        allowed: &AllowedRequest,
        hit: CachedResponse,
        request_id: Option<RequestId>,
        started: Instant,
    ) -> PipelineResponse {
        settle(&self.ctx, allowed, MicroUsd::ZERO);

        let mut event = allowed_event(&self.ctx, allowed, TelemetryOutcome::CacheHit, request_id);
        event.cache_hit = true;
        event.final_cost_usd = Some(0.0);
        event.tokens_out = hit.metadata.completion_tokens.unwrap_or(0);
        event.response_model = hit.metadata.model.clone();
        event.response_fingerprint = hit.metadata.system_fingerprint.clone();
        event.budget_after_usd = self.ctx.ledger.tenant_spend(&allowed.route.route.tenant).to_usd();
        event.latency_ms = elapsed_ms(started);

        publish(
            &self.ctx,
            event,
            WebhookEventType::RequestCacheHit,
            Some(&allowed.request.payload.candidate_text()),
        );
        PipelineResponse::Buffered {
            status: hit.status,
            body: hit.body,
            cache_hit: true,
        }
    }

    async fn buffered(
        &self,
        allowed: AllowedRequest,
        cache_key: Option<String>,
        request_id: Option<RequestId>,
        started: Instant,
    ) -> PipelineResponse {
        let route = &allowed.route.route;
        let routed = match self.router.send(route, &allowed.request).await {
            Ok(routed) => routed,
            Err(err) => return provider_failure(&self.ctx, &allowed, &err, request_id, started),
        };
        let response = routed.response;
        let metadata = &response.metadata;

        let tokens_in = metadata.prompt_tokens.unwrap_or(allowed.tokens_in);
        let tokens_out = metadata
            .completion_tokens
            .unwrap_or(allowed.tokens_out_estimate);
        let final_cost = realized_cost(&self.ctx, &allowed, tokens_in, tokens_out);
        settle(&self.ctx, &allowed, final_cost);
        let verdict = drift_verdict(&self.ctx, &allowed, metadata, final_cost);

        let mut event = completed_event(
            &self.ctx,
            &allowed,
            metadata,
            Settlement {
                tokens_in,
                tokens_out,
                final_cost,
            },
            &verdict,
            request_id,
        );
        event.retry_count = routed.attempts.saturating_sub(1);
        event.latency_ms = elapsed_ms(started);
        let excerpt = allowed.request.payload.candidate_text();

        if verdict.detected && allowed.drift_strict {
            let message = verdict
                .reason
                .as_ref()
                .map_or_else(|| "response drifted".to_string(), ToString::to_string);
            event.outcome = TelemetryOutcome::Blocked;
            event.allowed = false;
            event.block_reason = Some(BlockReason::DriftViolation);
            warn!(route = %route.name, reason = %message, "Drifted response withheld");
            publish(&self.ctx, event, WebhookEventType::RequestBlocked, Some(&excerpt));
            return PipelineResponse::Rejected(GatewayError {
                reason: BlockReason::DriftViolation,
                message,
                meta: None,
            });
        }

        if let Some(key) = cache_key {
            if (200..300).contains(&response.status) {
                self.ctx.caches.insert(
                    route,
                    key,
                    CachedResponse {
                        status: response.status,
                        body: response.body.clone(),
                        metadata: response.metadata.clone(),
                    },
                );
            }
        }

        publish(&self.ctx, event, WebhookEventType::RequestCompleted, Some(&excerpt));
        PipelineResponse::Buffered {
            status: response.status,
            body: response.body,
            cache_hit: false,
        }
    }

    async fn stream(
        &self,
        allowed: AllowedRequest,
        request_id: Option<RequestId>,
        started: Instant,
    ) -> PipelineResponse {
        let opened = match self
            .router
            .open_stream(&allowed.route.route, &allowed.request)
            .await
        {
            Ok(opened) => opened,
            Err(err) => return provider_failure(&self.ctx, &allowed, &err, request_id, started),
        };

        let ctx = Arc::clone(&self.ctx);
        let hook = Box::new(move |summary: &StreamSummary| {
            finish_stream(&ctx, &allowed, summary, request_id, started);
        });
        PipelineResponse::Streaming {
            status: opened.status,
            body: relay(opened.body, hook),
        }
    }
}

/// Realized token counts and cost of a completed call
#[derive(Debug, Clone, Copy)]
struct Settlement {
    tokens_in: u64,
    tokens_out: u64,
    final_cost: MicroUsd,
}

fn realized_cost(ctx: &GatewayContext, allowed: &AllowedRequest, tokens_in: u64, tokens_out: u64) -> MicroUsd {
    let provider = &allowed.route.route.provider;
    ctx.pricing
        .estimate_cost(provider.kind, provider.model.as_ref(), tokens_in, tokens_out)
}

/// Reconcile the ledger with the realized cost
fn settle(ctx: &GatewayContext, allowed: &AllowedRequest, final_cost: MicroUsd) {
    let tenant = &allowed.route.route.tenant;
    let route = allowed.route.name();
    match &allowed.reservation {
        Some(reservation) => ctx.ledger.finalize(tenant, route, reservation, final_cost),
        None => ctx.ledger.record(tenant, route, final_cost),
    }
}

fn drift_verdict(
    ctx: &GatewayContext,
    allowed: &AllowedRequest,
    metadata: &ResponseMetadata,
    final_cost: MicroUsd,
) -> DriftVerdict {
    let route = &allowed.route.route;
    let settings = route
        .policy
        .as_ref()
        .map(|policy| policy.drift_detection.clone())
        .unwrap_or_default();
    ctx.drift.detect(
        &route.name,
        &settings,
        DriftObservation {
            expected_model: route.provider.model.as_ref(),
            actual_model: metadata.model.as_deref(),
            fingerprint: metadata.system_fingerprint.as_deref(),
            expected_cost: allowed.est_cost,
            actual_cost: final_cost,
        },
    )
}

fn allowed_event(
    ctx: &GatewayContext,
    allowed: &AllowedRequest,
    outcome: TelemetryOutcome,
    request_id: Option<RequestId>,
) -> TelemetryEvent {
    let mut event = TelemetryEvent::new(outcome).with_request_id(request_id);
    event.attribute(&allowed.attribution());
    event.redaction_applied = allowed.redaction_applied;
    event.budget_before_usd = allowed.budget_before.to_usd();
    event.est_cost_usd = allowed.est_cost.to_usd();
    event.tokens_in = allowed.tokens_in;
    event.tokens_out = allowed.tokens_out_estimate;
    event.streamed = allowed.request.stream;
    event.config_checksum = ctx.checksum().to_string();
    event
}

fn completed_event(
    ctx: &GatewayContext,
    allowed: &AllowedRequest,
    metadata: &ResponseMetadata,
    settlement: Settlement,
    verdict: &DriftVerdict,
    request_id: Option<RequestId>,
) -> TelemetryEvent {
    let mut event = allowed_event(ctx, allowed, TelemetryOutcome::Success, request_id);
    event.tokens_in = settlement.tokens_in;
    event.tokens_out = settlement.tokens_out;
    event.final_cost_usd = Some(settlement.final_cost.to_usd());
    event.budget_after_usd = ctx.ledger.tenant_spend(&allowed.route.route.tenant).to_usd();
    event.response_model = metadata.model.clone();
    event.response_fingerprint = metadata.system_fingerprint.clone();
    event.drift_detected = verdict.detected;
    event.drift_reason = verdict.reason.as_ref().map(ToString::to_string);
    event
}

/// The call never produced a usable response. The reservation stays at the
/// estimate, which is also what replay will count for this event.
fn provider_failure(
    ctx: &GatewayContext,
    allowed: &AllowedRequest,
    error: &RouterError,
    request_id: Option<RequestId>,
    started: Instant,
) -> PipelineResponse {
    if allowed.reservation.is_none() {
        ctx.ledger
            .record(&allowed.route.route.tenant, allowed.route.name(), allowed.est_cost);
    }

    let mut event = allowed_event(ctx, allowed, TelemetryOutcome::ProviderError, request_id);
    event.retry_count = error.attempts.saturating_sub(1);
    event.error = Some(error.to_string());
    event.budget_after_usd = ctx.ledger.tenant_spend(&allowed.route.route.tenant).to_usd();
    event.latency_ms = elapsed_ms(started);

    warn!(route = %allowed.route.name(), attempts = error.attempts, error = %error.source, "Provider call failed");
    publish(
        ctx,
        event,
        WebhookEventType::ProviderError,
        Some(&allowed.request.payload.candidate_text()),
    );
    PipelineResponse::Rejected(GatewayError {
        reason: BlockReason::ProviderError,
        message: error.source.to_string(),
        meta: None,
    })
}

fn finish_stream(
    ctx: &GatewayContext,
    allowed: &AllowedRequest,
    summary: &StreamSummary,
    request_id: Option<RequestId>,
    started: Instant,
) {
    let excerpt = allowed.request.payload.candidate_text();

    if let (Some(error), false) = (&summary.error, summary.client_disconnected) {
        if allowed.reservation.is_none() {
            ctx.ledger
                .record(&allowed.route.route.tenant, allowed.route.name(), allowed.est_cost);
        }
        let mut event = allowed_event(ctx, allowed, TelemetryOutcome::ProviderError, request_id);
        event.tokens_out = summary.tokens_out();
        event.response_model = summary.metadata.model.clone();
        event.error = Some(error.clone());
        event.budget_after_usd = ctx.ledger.tenant_spend(&allowed.route.route.tenant).to_usd();
        event.latency_ms = elapsed_ms(started);
        warn!(route = %allowed.route.name(), error = %error, "Stream failed mid-flight");
        publish(ctx, event, WebhookEventType::ProviderError, Some(&excerpt));
        return;
    }

    let metadata = &summary.metadata;
    let tokens_in = metadata.prompt_tokens.unwrap_or(allowed.tokens_in);
    let tokens_out = summary.tokens_out();
    let final_cost = realized_cost(ctx, allowed, tokens_in, tokens_out);
    settle(ctx, allowed, final_cost);
    let verdict = drift_verdict(ctx, allowed, metadata, final_cost);

    let mut event = completed_event(
        ctx,
        allowed,
        metadata,
        Settlement {
            tokens_in,
            tokens_out,
            final_cost,
        },
        &verdict,
        request_id,
    );
    if summary.client_disconnected {
        event.error = Some("client disconnected".to_string());
    }
    event.latency_ms = elapsed_ms(started);
    publish(ctx, event, WebhookEventType::RequestCompleted, Some(&excerpt));
}

/// Record the event and notify webhook endpoints listening on its route
fn publish(
    ctx: &GatewayContext,
    event: TelemetryEvent,
    kind: WebhookEventType,
    sanitized_text: Option<&str>,
) {
    if let Some(route_name) = event.route.clone() {
        let route = ctx.catalog.route(&route_name);
        let reason = match (event.block_reason, event.outcome) {
            (Some(reason), _) => Some(reason.as_str().to_string()),
            (None, TelemetryOutcome::ProviderError) => {
                Some(BlockReason::ProviderError.as_str().to_string())
            }
            (None, _) => None,
        };
        let payload = WebhookPayload {
            event: kind,
            timestamp: event.timestamp,
            request_id: event.request_id.map(|id| id.to_string()),
            tenant: event.tenant.as_ref().map(ToString::to_string),
            route: route_name.to_string(),
            model: route
                .as_ref()
                .map(|route| route.route.provider.model.to_string()),
            decision: if event.allowed { "allowed" } else { "blocked" }.to_string(),
            reason,
            est_cost_usd: event.est_cost_usd,
            actual_cost_usd: event.final_cost_usd,
            tenant_spend_usd: event
                .tenant
                .as_ref()
                .map_or(0.0, |tenant| ctx.ledger.tenant_spend(tenant).to_usd()),
            route_spend_usd: ctx.ledger.route_spend(&route_name).to_usd(),
            redaction_mode: route
                .as_ref()
                .map_or("off", |route| route.route.redaction_mode().as_str())
                .to_string(),
            drift_detected: event.drift_detected,
            prompt_excerpt: None,
        };
        ctx.webhooks.notify(&route_name, payload, sanitized_text);
    }
    ctx.recorder.record(event);
}
