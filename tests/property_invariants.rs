//! Property-based tests for gateway invariants
//!
//! Budget reservations never over-commit, replay is idempotent, cache keys
//! ignore key order and correlation ids, block-mode redaction never lets a
//! matching prompt through, and the retry state machine always terminates.

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tollbooth::domain::{
    ChatMessage, GatewayConfig, GatewayRequest, MicroUsd, RedactionMode, RequestPayload,
    RetrySettings, Route, RouteName, TenantName,
};
use tollbooth::policy::{BudgetLedger, RedactionOutcome, Redactor};
use tollbooth::providers::ProviderError;
use tollbooth::proxy::build_cache_key;
use tollbooth::proxy::router::{next_step, RetryStep};
use tollbooth::telemetry::{TelemetryEvent, TelemetryOutcome};

pub mod generators {
    use super::*;
    use proptest::collection::vec;
    use proptest::string::string_regex;

    /// Estimates between 0 and 3 USD, in micro-dollars
    pub fn estimates() -> impl Strategy<Value = Vec<u64>> {
        vec(0u64..3_000_000, 1..40)
    }

    pub fn email() -> impl Strategy<Value = String> {
        (
            string_regex("[a-z][a-z0-9._]{0,10}").unwrap(),
            string_regex("[a-z]{1,10}").unwrap(),
            prop_oneof![Just("com"), Just("io"), Just("org"), Just("co.uk")],
        )
            .prop_map(|(local, domain, tld)| format!("{local}@{domain}.{tld}"))
    }

    pub fn filler() -> impl Strategy<Value = String> {
        string_regex("[A-Za-z ,.!?]{0,40}").unwrap()
    }

    pub fn params() -> impl Strategy<Value = Vec<(String, Value)>> {
        vec(
            (
                prop_oneof![
                    Just("temperature"),
                    Just("top_p"),
                    Just("seed"),
                    Just("user"),
                    Just("n")
                ],
                0u32..100,
            ),
            0..5,
        )
        .prop_map(|pairs| {
            let mut seen = std::collections::HashSet::new();
            pairs
                .into_iter()
                .filter(|(key, _)| seen.insert(*key))
                .map(|(key, value)| (key.to_string(), json!(value)))
                .collect()
        })
    }

    pub fn provider_errors() -> impl Strategy<Value = ProviderError> {
        prop_oneof![
            Just(ProviderError::Network("reset".to_string())),
            Just(ProviderError::Timeout(Duration::from_millis(50))),
            (400u16..600).prop_map(|status| ProviderError::Status {
                status,
                code: None,
                message: "upstream".to_string(),
            }),
        ]
    }

    pub fn retry_settings() -> impl Strategy<Value = RetrySettings> {
        (1u32..12, 0u64..5_000, 0u64..60_000, any::<bool>()).prop_map(
            |(max_attempts, base_ms, max_elapsed_ms, jitter)| RetrySettings {
                max_attempts,
                base_ms,
                max_elapsed_ms,
                jitter,
                ..RetrySettings::default()
            },
        )
    }
}

fn tenant() -> TenantName {
    TenantName::try_new("acme".to_string()).unwrap()
}

fn route_name() -> RouteName {
    RouteName::try_new("chat".to_string()).unwrap()
}

fn chat_route() -> Route {
    chat_route_with("gpt-4o", "off")
}

fn chat_route_with(model: &str, redaction_mode: &str) -> Route {
    GatewayConfig::from_json_str(
        &json!({
            "tenants": [],
            "routes": [{
                "name": "chat",
                "tenant": "acme",
                "provider": {"type": "openai", "model": model, "endpoint_type": "chat"},
                "policy": {"redaction": {"mode": redaction_mode}},
                "cache": {"enabled": true, "include_params": true}
            }],
            "callers": []
        })
        .to_string(),
    )
    .unwrap()
    .routes
    .remove(0)
}

fn chat_request(params: Map<String, Value>) -> GatewayRequest {
    GatewayRequest {
        payload: RequestPayload::Chat {
            messages: vec![ChatMessage::new("user", "hello")],
        },
        params,
        stream: false,
    }
}

fn spend_event(micros: u64) -> TelemetryEvent {
    let mut event = TelemetryEvent::new(TelemetryOutcome::Success);
    event.tenant = Some(tenant());
    event.route = Some(route_name());
    event.final_cost_usd = Some(MicroUsd::from_micros(micros).to_usd());
    event
}

proptest! {
    #[test]
    fn reservations_never_exceed_the_caps(
        estimates in generators::estimates(),
        tenant_cap in 0u64..20_000_000,
        route_cap in proptest::option::of(0u64..20_000_000),
    ) {
        let ledger = BudgetLedger::new();
        let tenant_cap = MicroUsd::from_micros(tenant_cap);
        let route_cap = route_cap.map(MicroUsd::from_micros);

        for estimate in estimates {
            let before = ledger.tenant_spend(&tenant());
            let result = ledger.check_and_reserve(
                &tenant(),
                &route_name(),
                MicroUsd::from_micros(estimate),
                route_cap,
                tenant_cap,
            );
            let after = ledger.tenant_spend(&tenant());
            match result {
                Ok(reservation) => {
                    prop_assert_eq!(reservation.tenant_before, before);
                    prop_assert_eq!(after, before.saturating_add(MicroUsd::from_micros(estimate)));
                }
                Err(rejection) => {
                    prop_assert_eq!(rejection.tenant_before, before);
                    prop_assert_eq!(after, before);
                }
            }
            prop_assert!(after <= tenant_cap);
            if let Some(cap) = route_cap {
                prop_assert!(ledger.route_spend(&route_name()) <= cap);
            }
        }
    }

    #[test]
    fn replay_is_idempotent(costs in proptest::collection::vec(0u64..5_000_000, 0..30)) {
        let events: Vec<TelemetryEvent> = costs.iter().copied().map(spend_event).collect();
        let expected = MicroUsd::from_micros(costs.iter().sum());

        let ledger = BudgetLedger::new();
        ledger.rebuild_from_rows(&events);
        prop_assert_eq!(ledger.tenant_spend(&tenant()), expected);

        ledger.rebuild_from_rows(&events);
        prop_assert_eq!(ledger.tenant_spend(&tenant()), expected);

        let doubled: Vec<TelemetryEvent> = events.iter().chain(events.iter()).cloned().collect();
        ledger.rebuild_from_rows(&doubled);
        prop_assert_eq!(ledger.tenant_spend(&tenant()), expected);
        prop_assert_eq!(ledger.route_spend(&route_name()), expected);
    }

    #[test]
    fn cache_keys_ignore_key_order_and_correlation_ids(
        params in generators::params(),
        request_id in "[a-f0-9]{8}",
    ) {
        let route = chat_route();
        let forward: Map<String, Value> = params.iter().cloned().collect();
        let mut reversed: Map<String, Value> = params.iter().rev().cloned().collect();
        reversed.insert("request_id".to_string(), json!(request_id));
        reversed.insert("trace_id".to_string(), json!("trace"));

        prop_assert_eq!(
            build_cache_key(&route, &chat_request(forward), true),
            build_cache_key(&route, &chat_request(reversed), true)
        );
    }

    #[test]
    fn cache_keys_change_with_model_and_redaction_mode(
        params in generators::params(),
        model in prop_oneof![Just("gpt-4o-mini"), Just("gpt-4.1"), Just("o3-mini")],
        mode in prop_oneof![Just("warn"), Just("block")],
    ) {
        let request = chat_request(params.into_iter().collect());
        let base = build_cache_key(&chat_route(), &request, true);

        prop_assert_ne!(&base, &build_cache_key(&chat_route_with(model, "off"), &request, true));
        prop_assert_ne!(&base, &build_cache_key(&chat_route_with("gpt-4o", mode), &request, true));
    }

    #[test]
    fn block_mode_never_passes_a_matching_prompt(
        before in generators::filler(),
        email in generators::email(),
        after in generators::filler(),
    ) {
        let redactor = Redactor::compile(&["email".to_string()]).unwrap();
        let text = format!("{before} {email} {after}");
        let outcome = redactor.redact(&text, RedactionMode::Block);
        prop_assert!(
            matches!(outcome, RedactionOutcome::Blocked { .. }),
            "{} slipped through",
            text
        );
    }

    #[test]
    fn retries_terminate_within_attempt_and_time_budgets(
        settings in generators::retry_settings(),
        errors in proptest::collection::vec(generators::provider_errors(), 1..20),
        seed in any::<u64>(),
    ) {
        let mut rng = StdRng::seed_from_u64(seed);
        let budget = Duration::from_millis(settings.max_elapsed_ms);
        let mut elapsed = Duration::ZERO;
        let mut attempt = 1u32;

        for error in errors.iter().cycle() {
            match next_step(&settings, attempt, elapsed, error, &mut rng) {
                RetryStep::Retry { delay } => {
                    elapsed += delay;
                    attempt += 1;
                    prop_assert!(elapsed <= budget);
                }
                RetryStep::GiveUp => break,
            }
            prop_assert!(attempt <= settings.max_attempts);
        }
        prop_assert!(attempt <= settings.max_attempts);
    }
}
