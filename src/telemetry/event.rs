//! The one-per-request outcome record

use crate::domain::{MicroUsd, RequestId, RouteName, ServiceLabel, TenantName};
use crate::policy::{Attribution, BlockMeta, BlockReason};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Terminal branch a request ended on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryOutcome {
    Blocked,
    Success,
    CacheHit,
    ProviderError,
}

/// Immutable once recorded. Costs are USD floats converted from integer
/// micro-dollars, so they convert back exactly on replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub request_id: Option<RequestId>,
    #[serde(default)]
    pub tenant: Option<TenantName>,
    #[serde(default)]
    pub route: Option<RouteName>,
    #[serde(default)]
    pub service: Option<ServiceLabel>,
    pub outcome: TelemetryOutcome,
    pub allowed: bool,
    #[serde(default)]
    pub block_reason: Option<BlockReason>,
    #[serde(default)]
    pub block_meta: Option<BlockMeta>,
    #[serde(default)]
    pub redaction_applied: bool,
    #[serde(default)]
    pub drift_detected: bool,
    #[serde(default)]
    pub drift_reason: Option<String>,
    #[serde(default)]
    pub budget_before_usd: f64,
    #[serde(default)]
    pub budget_after_usd: f64,
    #[serde(default)]
    pub est_cost_usd: f64,
    /// Realized cost; absent when the call never settled
    #[serde(default)]
    pub final_cost_usd: Option<f64>,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default)]
    pub response_model: Option<String>,
    #[serde(default)]
    pub response_fingerprint: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub cache_hit: bool,
    #[serde(default)]
    pub streamed: bool,
    #[serde(default)]
    pub config_checksum: String,
    #[serde(default)]
    pub error: Option<String>,
}

impl TelemetryEvent {
    pub fn new(outcome: TelemetryOutcome) -> Self {
        Self {
            id: Uuid::now_v7(),
            timestamp: Utc::now(),
            request_id: None,
            tenant: None,
            route: None,
            service: None,
            outcome,
            allowed: outcome != TelemetryOutcome::Blocked,
            block_reason: None,
            block_meta: None,
            redaction_applied: false,
            drift_detected: false,
            drift_reason: None,
            budget_before_usd: 0.0,
            budget_after_usd: 0.0,
            est_cost_usd: 0.0,
            final_cost_usd: None,
            tokens_in: 0,
            tokens_out: 0,
            latency_ms: 0,
            response_model: None,
            response_fingerprint: None,
            retry_count: 0,
            cache_hit: false,
            streamed: false,
            config_checksum: String::new(),
            error: None,
        }
    }

    /// A zero-cost blocked event
    pub fn blocked(
        reason: BlockReason,
        meta: Option<BlockMeta>,
        attribution: &Attribution,
        checksum: &str,
    ) -> Self {
        let mut event = Self::new(TelemetryOutcome::Blocked);
        event.block_reason = Some(reason);
        event.block_meta = meta;
        event.final_cost_usd = Some(0.0);
        event.config_checksum = checksum.to_string();
        event.attribute(attribution);
        event
    }

    pub fn attribute(&mut self, attribution: &Attribution) {
        self.tenant = attribution.tenant.clone();
        self.route = attribution.route.clone();
        self.service = attribution.service.clone();
    }

    pub fn with_request_id(mut self, request_id: Option<RequestId>) -> Self {
        self.request_id = request_id;
        self
    }

    /// Spend this event contributes when the ledger is rebuilt
    pub fn replay_cost(&self) -> MicroUsd {
        MicroUsd::from_usd(self.final_cost_usd.unwrap_or(self.est_cost_usd))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_prefers_final_cost() {
        let mut event = TelemetryEvent::new(TelemetryOutcome::Success);
        event.est_cost_usd = 2.0;
        assert_eq!(event.replay_cost(), MicroUsd::from_usd(2.0));
        event.final_cost_usd = Some(0.000125);
        assert_eq!(event.replay_cost().as_micros(), 125);
    }

    #[test]
    fn blocked_events_cost_nothing() {
        let event = TelemetryEvent::blocked(
            BlockReason::Unauthorized,
            None,
            &Attribution::default(),
            "abc",
        );
        assert!(!event.allowed);
        assert_eq!(event.replay_cost(), MicroUsd::ZERO);
        assert_eq!(event.config_checksum, "abc");
    }

    #[test]
    fn events_survive_a_json_line() {
        let mut event = TelemetryEvent::new(TelemetryOutcome::CacheHit);
        event.cache_hit = true;
        event.route = Some(RouteName::try_new("embed".to_string()).unwrap());
        let line = serde_json::to_string(&event).unwrap();
        let parsed: TelemetryEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed, event);
    }
}
