//! Policy decisions and block reasons

use crate::domain::{GatewayRequest, MicroUsd, RouteName, ServiceLabel, TenantName};
use crate::policy::budget::Reservation;
use crate::policy::catalog::{CallerContext, CatalogRoute};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Why a request did not reach, or did not come back from, the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    Unauthorized,
    NotAllowed,
    UnknownRoute,
    TenantMismatch,
    InvalidBody,
    InvalidParams,
    MaxTokensInExceeded,
    RedactionBlocked,
    UnknownTenant,
    BudgetExceeded,
    DriftViolation,
    ProviderError,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::NotAllowed => "not_allowed",
            Self::UnknownRoute => "unknown_route",
            Self::TenantMismatch => "tenant_mismatch",
            Self::InvalidBody => "invalid_body",
            Self::InvalidParams => "invalid_params",
            Self::MaxTokensInExceeded => "max_tokens_in_exceeded",
            Self::RedactionBlocked => "redaction_blocked",
            Self::UnknownTenant => "unknown_tenant",
            Self::BudgetExceeded => "budget_exceeded",
            Self::DriftViolation => "drift_violation",
            Self::ProviderError => "provider_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotAllowed | Self::TenantMismatch => StatusCode::FORBIDDEN,
            Self::UnknownRoute
            | Self::InvalidBody
            | Self::InvalidParams
            | Self::MaxTokensInExceeded
            | Self::RedactionBlocked
            | Self::DriftViolation => StatusCode::BAD_REQUEST,
            Self::BudgetExceeded => StatusCode::TOO_MANY_REQUESTS,
            Self::UnknownTenant => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ProviderError => StatusCode::BAD_GATEWAY,
        }
    }

    /// OpenAI error `type` field
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Unauthorized => "authentication_error",
            Self::NotAllowed | Self::TenantMismatch => "permission_error",
            Self::BudgetExceeded => "insufficient_quota",
            Self::UnknownTenant => "server_error",
            Self::ProviderError => "upstream_error",
            _ => "invalid_request_error",
        }
    }

    /// OpenAI error `code` field
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "invalid_api_key",
            other => other.as_str(),
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extra detail attached to some blocks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockMeta {
    Budget {
        tenant_budget_before_usd: f64,
        route_budget_before_usd: f64,
    },
    InvalidParams {
        keys: Vec<String>,
    },
    TokenCap {
        estimated: u64,
        limit: u32,
    },
    Redaction {
        rules: Vec<String>,
    },
}

/// Who a request is attributed to in telemetry, as far as it got
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attribution {
    pub tenant: Option<TenantName>,
    pub route: Option<RouteName>,
    pub service: Option<ServiceLabel>,
}

#[derive(Debug, Clone)]
pub struct BlockedRequest {
    pub reason: BlockReason,
    pub message: String,
    pub meta: Option<BlockMeta>,
    pub attribution: Attribution,
    /// Candidate text the request carried, for webhook prompt excerpts
    pub excerpt_source: Option<String>,
}

impl BlockedRequest {
    pub fn new(reason: BlockReason, message: impl Into<String>, attribution: Attribution) -> Self {
        Self {
            reason,
            message: message.into(),
            meta: None,
            attribution,
            excerpt_source: None,
        }
    }

    pub fn with_meta(mut self, meta: BlockMeta) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// A request cleared to proceed, carrying its sanitized payload
#[derive(Debug, Clone)]
pub struct AllowedRequest {
    pub caller: Arc<CallerContext>,
    pub route: Arc<CatalogRoute>,
    /// Post-redaction payload with merged, validated parameters
    pub request: GatewayRequest,
    pub tokens_in: u64,
    pub tokens_out_estimate: u64,
    /// Tenant spend before this request's reservation
    pub budget_before: MicroUsd,
    pub est_cost: MicroUsd,
    /// `None` for routes without a policy, whose spend is recorded after the fact
    pub reservation: Option<Reservation>,
    pub redaction_applied: bool,
    pub drift_strict: bool,
}

impl AllowedRequest {
    pub fn attribution(&self) -> Attribution {
        Attribution {
            tenant: Some(self.route.route.tenant.clone()),
            route: Some(self.route.name().clone()),
            service: Some(self.caller.service_label.clone()),
        }
    }
}

#[derive(Debug, Clone)]
pub enum PolicyDecision {
    Blocked(BlockedRequest),
    Allowed(Box<AllowedRequest>),
}

impl PolicyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed(_))
    }

    pub fn block_reason(&self) -> Option<BlockReason> {
        match self {
            Self::Blocked(blocked) => Some(blocked.reason),
            Self::Allowed(_) => None,
        }
    }
}
