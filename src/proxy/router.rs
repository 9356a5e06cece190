//! Provider router: one logical call, possibly several upstream attempts
//!
//! Retry state machine for buffered calls:
//!
//! - auth failures are terminal
//! - network failures (no HTTP status, including attempt timeouts) retry
//! - status failures retry iff the status is in the route's `retry_on`
//!
//! Another attempt is made only while `attempt < max_attempts` and the time
//! since the first attempt is under `max_elapsed_ms`. Streaming calls get a
//! single attempt.

use crate::domain::{duration_ms, GatewayRequest, RetrySettings, Route};
use crate::providers::{
    BufferedResponse, FailureClass, ProviderError, ProviderRegistry, StreamingResponse,
};
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// The last provider error, tagged with how many attempts were made
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{source} (after {attempts} attempt(s))")]
pub struct RouterError {
    #[source]
    pub source: ProviderError,
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct RoutedResponse {
    pub response: BufferedResponse,
    pub attempts: u32,
    pub latency: Duration,
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStep {
    Retry { delay: Duration },
    GiveUp,
}

pub fn is_retryable(settings: &RetrySettings, error: &ProviderError) -> bool {
    match error.class() {
        FailureClass::Auth | FailureClass::Fatal => false,
        FailureClass::Network => true,
        FailureClass::Status(status) => settings.retry_on.contains(&status),
    }
}

/// `base_ms * 2^(attempt - 1)`, saturating
pub fn backoff_delay(settings: &RetrySettings, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let millis = settings
        .base_ms
        .saturating_mul(1u64.checked_shl(exponent).unwrap_or(u64::MAX));
    Duration::from_millis(millis)
}

/// Decide the transition out of `Attempting(attempt)` after `error`.
///
/// The delay never runs past the `max_elapsed_ms` budget.
pub fn next_step<R: Rng>(
    settings: &RetrySettings,
    attempt: u32,
    elapsed: Duration,
    error: &ProviderError,
    rng: &mut R,
) -> RetryStep {
    let budget = Duration::from_millis(settings.max_elapsed_ms);
    if !is_retryable(settings, error) || attempt >= settings.max_attempts || elapsed >= budget {
        return RetryStep::GiveUp;
    }

    let mut delay = backoff_delay(settings, attempt);
    if settings.jitter {
        let ceiling = duration_ms(delay);
        delay = Duration::from_millis(rng.gen_range(0..=ceiling));
    }
    RetryStep::Retry {
        delay: delay.min(budget - elapsed),
    }
}

#[derive(Clone)]
pub struct ProviderRouter {
    registry: Arc<ProviderRegistry>,
}

impl ProviderRouter {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self { registry }
    }

    /// Buffered call with retries
    #[instrument(skip(self, route, request), fields(route = %route.name))]
    pub async fn send(
        &self,
        route: &Route,
        request: &GatewayRequest,
    ) -> Result<RoutedResponse, RouterError> {
        let settings = route.retry_settings();
        let adapter = self
            .registry
            .adapter(route.provider.kind)
            .map_err(|source| RouterError {
                source,
                attempts: 0,
            })?;
        let attempt_timeout = settings.attempt_timeout_ms.map(Duration::from_millis);
        let started = Instant::now();
        let mut attempt = 1;

        loop {
            let result = match attempt_timeout {
                Some(limit) => tokio::time::timeout(limit, adapter.send(route, request))
                    .await
                    .unwrap_or(Err(ProviderError::Timeout(limit))),
                None => adapter.send(route, request).await,
            };

            let error = match result {
                Ok(response) => {
                    debug!(attempt, "Provider call succeeded");
                    return Ok(RoutedResponse {
                        response,
                        attempts: attempt,
                        latency: started.elapsed(),
                    });
                }
                Err(error) => error,
            };

            let step = next_step(
                &settings,
                attempt,
                started.elapsed(),
                &error,
                &mut rand::thread_rng(),
            );
            match step {
                RetryStep::Retry { delay } => {
                    warn!(attempt, error = %error, delay_ms = duration_ms(delay), "Provider attempt failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                RetryStep::GiveUp => {
                    warn!(attempt, error = %error, "Provider call failed");
                    return Err(RouterError {
                        source: error,
                        attempts: attempt,
                    });
                }
            }
        }
    }

    /// Streaming call; a single attempt whose opening is bounded by the
    /// route's attempt timeout
    #[instrument(skip(self, route, request), fields(route = %route.name))]
    pub async fn open_stream(
        &self,
        route: &Route,
        request: &GatewayRequest,
    ) -> Result<StreamingResponse, RouterError> {
        let fail = |source| RouterError {
            source,
            attempts: 1,
        };
        let adapter = self
            .registry
            .adapter(route.provider.kind)
            .map_err(|source| RouterError {
                source,
                attempts: 0,
            })?;
        let opened = match route
            .retry_settings()
            .attempt_timeout_ms
            .map(Duration::from_millis)
        {
            Some(limit) => tokio::time::timeout(limit, adapter.open_stream(route, request))
                .await
                .unwrap_or(Err(ProviderError::Timeout(limit))),
            None => adapter.open_stream(route, request).await,
        };
        opened.map_err(fail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChatMessage, GatewayConfig, ProviderKind, RequestPayload};
    use crate::providers::{ProviderAdapter, ResponseMetadata};
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use rand::rngs::mock::StepRng;
    use rstest::rstest;
    use serde_json::json;
    use std::collections::VecDeque;

    /// Replays a scripted sequence of results
    struct ScriptedAdapter {
        script: Mutex<VecDeque<Result<(), ProviderError>>>,
        calls: Mutex<u32>,
        delay: Duration,
    }

    impl ScriptedAdapter {
        fn new(script: Vec<Result<(), ProviderError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(0),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedAdapter {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Openai
        }

        async fn send(
            &self,
            _route: &Route,
            _request: &GatewayRequest,
        ) -> Result<BufferedResponse, ProviderError> {
            *self.calls.lock() += 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = self.script.lock().pop_front().unwrap_or(Ok(()));
            next.map(|()| BufferedResponse {
                status: 200,
                body: Bytes::from_static(b"{}"),
                metadata: ResponseMetadata::default(),
            })
        }

        async fn open_stream(
            &self,
            _route: &Route,
            _request: &GatewayRequest,
        ) -> Result<StreamingResponse, ProviderError> {
            Err(ProviderError::Unsupported("scripted"))
        }
    }

    fn route(retries: serde_json::Value) -> Route {
        let config = json!({
            "tenants": [],
            "routes": [{
                "name": "chat",
                "tenant": "acme",
                "provider": {"type": "openai", "model": "gpt-4o", "endpoint_type": "chat"},
                "retries": retries
            }],
            "callers": []
        });
        GatewayConfig::from_json_str(&config.to_string())
            .unwrap()
            .routes
            .remove(0)
    }

    fn request() -> GatewayRequest {
        GatewayRequest {
            payload: RequestPayload::Chat {
                messages: vec![ChatMessage::new("user", "hi")],
            },
            params: Default::default(),
            stream: false,
        }
    }

    fn router_with(adapter: Arc<ScriptedAdapter>) -> ProviderRouter {
        let mut registry = ProviderRegistry::new();
        registry.register(adapter);
        ProviderRouter::new(Arc::new(registry))
    }

    fn status(code: u16) -> ProviderError {
        ProviderError::Status {
            status: code,
            code: None,
            message: "upstream".to_string(),
        }
    }

    #[rstest]
    #[case(1, 100)]
    #[case(2, 200)]
    #[case(3, 400)]
    #[case(4, 800)]
    fn backoff_doubles(#[case] attempt: u32, #[case] expected_ms: u64) {
        let settings = RetrySettings {
            base_ms: 100,
            ..RetrySettings::default()
        };
        assert_eq!(
            backoff_delay(&settings, attempt),
            Duration::from_millis(expected_ms)
        );
    }

    #[test]
    fn auth_errors_are_never_retried() {
        let settings = RetrySettings::default();
        let auth = ProviderError::Auth {
            status: Some(401),
            message: "bad key".to_string(),
        };
        assert_eq!(
            next_step(&settings, 1, Duration::ZERO, &auth, &mut StepRng::new(0, 1)),
            RetryStep::GiveUp
        );
    }

    #[test]
    fn statuses_outside_retry_on_are_terminal() {
        let settings = RetrySettings::default();
        let mut rng = StepRng::new(0, 1);
        assert_eq!(
            next_step(&settings, 1, Duration::ZERO, &status(400), &mut rng),
            RetryStep::GiveUp
        );
        assert!(matches!(
            next_step(&settings, 1, Duration::ZERO, &status(503), &mut rng),
            RetryStep::Retry { .. }
        ));
    }

    #[test]
    fn elapsed_budget_caps_the_delay() {
        let settings = RetrySettings {
            base_ms: 1_000,
            max_elapsed_ms: 1_500,
            ..RetrySettings::default()
        };
        let step = next_step(
            &settings,
            1,
            Duration::from_millis(1_200),
            &ProviderError::Network("reset".to_string()),
            &mut StepRng::new(0, 1),
        );
        assert_eq!(
            step,
            RetryStep::Retry {
                delay: Duration::from_millis(300)
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let adapter = Arc::new(ScriptedAdapter::new(vec![
            Err(status(503)),
            Err(ProviderError::Network("reset".to_string())),
        ]));
        let router = router_with(adapter.clone());
        let routed = router
            .send(&route(json!({"max_attempts": 3, "base_ms": 10})), &request())
            .await
            .unwrap();
        assert_eq!(routed.attempts, 3);
        assert_eq!(*adapter.calls.lock(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let adapter = Arc::new(ScriptedAdapter::new(vec![
            Err(status(502)),
            Err(status(502)),
            Err(status(502)),
        ]));
        let router = router_with(adapter.clone());
        let err = router
            .send(&route(json!({"max_attempts": 2, "base_ms": 10})), &request())
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 2);
        assert_eq!(err.source, status(502));
    }

    #[tokio::test(start_paused = true)]
    async fn routes_without_retries_make_one_attempt() {
        let adapter = Arc::new(ScriptedAdapter::new(vec![Err(status(503))]));
        let router = router_with(adapter.clone());
        let config = json!({
            "tenants": [],
            "routes": [{
                "name": "chat",
                "tenant": "acme",
                "provider": {"type": "openai", "model": "gpt-4o", "endpoint_type": "chat"}
            }],
            "callers": []
        });
        let route = GatewayConfig::from_json_str(&config.to_string())
            .unwrap()
            .routes
            .remove(0);
        let err = router.send(&route, &request()).await.unwrap_err();
        assert_eq!(err.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempts_time_out_and_retry() {
        let mut adapter = ScriptedAdapter::new(vec![]);
        adapter.delay = Duration::from_millis(500);
        let adapter = Arc::new(adapter);
        let router = router_with(adapter.clone());
        let err = router
            .send(
                &route(json!({"max_attempts": 2, "base_ms": 1, "attempt_timeout_ms": 50})),
                &request(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.source, ProviderError::Timeout(Duration::from_millis(50)));
        assert_eq!(err.attempts, 2);
    }
}
