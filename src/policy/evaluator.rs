//! Policy evaluator
//!
//! Turns an authenticated request into one [`PolicyDecision`]. The checks run
//! in a fixed order and the first failure wins: identity and routing, then
//! parameters and token caps, then redaction, then the budget reservation.
//! Nothing touches the ledger until every cheaper check has passed.

use crate::domain::{GatewayRequest, MicroUsd, RouteName};
use crate::policy::budget::BudgetLedger;
use crate::policy::catalog::{CallerContext, CatalogRoute, RouteCatalog};
use crate::policy::decision::{
    AllowedRequest, Attribution, BlockMeta, BlockReason, BlockedRequest, PolicyDecision,
};
use crate::policy::params::{merge_and_validate, requested_output_cap};
use crate::policy::pricing::PriceTable;
use crate::policy::redaction::RedactionOutcome;
use crate::policy::tokens::{estimate_output_tokens, estimate_tokens};
use std::sync::Arc;
use tracing::{debug, instrument};

#[derive(Debug, Clone)]
pub struct PolicyEvaluator {
    catalog: Arc<RouteCatalog>,
    ledger: Arc<BudgetLedger>,
    pricing: Arc<PriceTable>,
}

fn blocked(reason: BlockReason, message: impl Into<String>, attribution: Attribution) -> PolicyDecision {
    debug!(reason = %reason, route = ?attribution.route, "Request blocked by policy");
    PolicyDecision::Blocked(BlockedRequest::new(reason, message, attribution))
}

impl PolicyEvaluator {
    pub fn new(catalog: Arc<RouteCatalog>, ledger: Arc<BudgetLedger>, pricing: Arc<PriceTable>) -> Self {
        Self {
            catalog,
            ledger,
            pricing,
        }
    }

    pub fn catalog(&self) -> &Arc<RouteCatalog> {
        &self.catalog
    }

    #[instrument(skip(self, token, request))]
    pub fn evaluate(
        &self,
        token: Option<&str>,
        route_name: &str,
        request: GatewayRequest,
    ) -> PolicyDecision {
        let Some(caller) = token.and_then(|token| self.catalog.resolve_caller(token)) else {
            return blocked(
                BlockReason::Unauthorized,
                "missing or unknown service token",
                Attribution::default(),
            );
        };

        let route_id = RouteName::try_new(route_name.to_string()).ok();
        let mut attribution = Attribution {
            tenant: Some(caller.tenant.clone()),
            route: route_id.clone(),
            service: Some(caller.service_label.clone()),
        };

        let Some(route_id) = route_id.filter(|route| caller.may_use(route)) else {
            return blocked(
                BlockReason::NotAllowed,
                format!("route '{route_name}' is not allowed for this caller"),
                attribution,
            );
        };

        let Some(route) = self.catalog.route(&route_id) else {
            return blocked(
                BlockReason::UnknownRoute,
                format!("unknown route '{route_name}'"),
                attribution,
            );
        };
        let endpoint = request.payload.endpoint_type();
        if route.route.provider.endpoint_type != endpoint {
            return blocked(
                BlockReason::UnknownRoute,
                format!(
                    "route '{route_name}' does not serve the {} endpoint",
                    endpoint.as_str()
                ),
                attribution,
            );
        }

        if route.route.tenant != caller.tenant {
            return blocked(
                BlockReason::TenantMismatch,
                format!("route '{route_name}' belongs to another tenant"),
                attribution,
            );
        }
        attribution.tenant = Some(route.route.tenant.clone());

        let Some(policy) = route.route.policy.clone() else {
            return self.pass_through(caller, route, request, attribution);
        };

        let params = match merge_and_validate(
            endpoint,
            &route.route.provider.default_params,
            &request.params,
            policy.max_tokens_out,
        ) {
            Ok(params) => params,
            Err(err) => {
                let keys = err.keys();
                return PolicyDecision::Blocked(
                    BlockedRequest::new(BlockReason::InvalidParams, err.to_string(), attribution)
                        .with_meta(BlockMeta::InvalidParams { keys }),
                );
            }
        };

        let candidate = request.payload.candidate_text();
        let tokens_in = estimate_tokens(&candidate);
        if let Some(limit) = policy.max_tokens_in {
            if tokens_in > u64::from(limit) {
                debug!(tokens_in, limit, "Input token cap exceeded");
                return PolicyDecision::Blocked(
                    BlockedRequest::new(
                        BlockReason::MaxTokensInExceeded,
                        format!("estimated {tokens_in} input tokens exceeds the limit of {limit}"),
                        attribution,
                    )
                    .with_meta(BlockMeta::TokenCap {
                        estimated: tokens_in,
                        limit,
                    }),
                );
            }
        }

        let tokens_out_estimate =
            estimate_output_tokens(endpoint, requested_output_cap(&params), policy.max_tokens_out);

        let mode = policy.redaction.mode;
        let (payload, redaction_applied) = match route.redactor.redact(&candidate, mode) {
            RedactionOutcome::Blocked { matched } => {
                return PolicyDecision::Blocked(
                    BlockedRequest::new(
                        BlockReason::RedactionBlocked,
                        "request content matched a redaction rule",
                        attribution,
                    )
                    .with_meta(BlockMeta::Redaction { rules: matched }),
                );
            }
            RedactionOutcome::Passed {
                output,
                applied: true,
            } => (request.payload.with_scrubbed_text(&output), true),
            RedactionOutcome::Passed { applied: false, .. } => (request.payload, false),
        };
        let sanitized = GatewayRequest {
            payload,
            params,
            stream: request.stream,
        };

        let Some(tenant) = self.catalog.tenant(&route.route.tenant) else {
            let mut block = BlockedRequest::new(
                BlockReason::UnknownTenant,
                format!("route '{route_name}' references an unknown tenant"),
                attribution,
            );
            block.excerpt_source = Some(sanitized.payload.candidate_text());
            return PolicyDecision::Blocked(block);
        };

        let est_cost = self.pricing.estimate_cost(
            route.route.provider.kind,
            route.route.provider.model.as_ref(),
            tokens_in,
            tokens_out_estimate,
        );
        let route_cap = policy.budget_daily_usd.map(MicroUsd::from_usd);
        let tenant_cap = MicroUsd::from_usd(tenant.daily_spend_cap_usd);

        let reservation = match self.ledger.check_and_reserve(
            &tenant.name,
            &route_id,
            est_cost,
            route_cap,
            tenant_cap,
        ) {
            Ok(reservation) => reservation,
            Err(rejection) => {
                let mut block = BlockedRequest::new(
                    BlockReason::BudgetExceeded,
                    "daily spend cap reached",
                    attribution,
                )
                .with_meta(BlockMeta::Budget {
                    tenant_budget_before_usd: rejection.tenant_before.to_usd(),
                    route_budget_before_usd: rejection.route_before.to_usd(),
                });
                block.excerpt_source = Some(sanitized.payload.candidate_text());
                debug!(reason = %block.reason, "Request blocked by policy");
                return PolicyDecision::Blocked(block);
            }
        };

        PolicyDecision::Allowed(Box::new(AllowedRequest {
            caller,
            route,
            request: sanitized,
            tokens_in,
            tokens_out_estimate,
            budget_before: reservation.tenant_before,
            est_cost,
            reservation: Some(reservation),
            redaction_applied,
            drift_strict: policy.drift_strict,
        }))
    }

    /// Routes without a policy: parameters are still validated and cost is
    /// estimated for telemetry, but nothing is reserved.
    fn pass_through(
        &self,
        caller: Arc<CallerContext>,
        route: Arc<CatalogRoute>,
        request: GatewayRequest,
        attribution: Attribution,
    ) -> PolicyDecision {
        let endpoint = request.payload.endpoint_type();
        let params = match merge_and_validate(
            endpoint,
            &route.route.provider.default_params,
            &request.params,
            None,
        ) {
            Ok(params) => params,
            Err(err) => {
                let keys = err.keys();
                return PolicyDecision::Blocked(
                    BlockedRequest::new(BlockReason::InvalidParams, err.to_string(), attribution)
                        .with_meta(BlockMeta::InvalidParams { keys }),
                );
            }
        };

        let tokens_in = estimate_tokens(&request.payload.candidate_text());
        let tokens_out_estimate =
            estimate_output_tokens(endpoint, requested_output_cap(&params), None);
        let est_cost = self.pricing.estimate_cost(
            route.route.provider.kind,
            route.route.provider.model.as_ref(),
            tokens_in,
            tokens_out_estimate,
        );
        let budget_before = self.ledger.tenant_spend(&route.route.tenant);

        PolicyDecision::Allowed(Box::new(AllowedRequest {
            caller,
            route,
            request: GatewayRequest {
                payload: request.payload,
                params,
                stream: request.stream,
            },
            tokens_in,
            tokens_out_estimate,
            budget_before,
            est_cost,
            reservation: None,
            redaction_applied: false,
            drift_strict: false,
        }))
    }
}
