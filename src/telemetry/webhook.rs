//! Webhook trigger points
//!
//! The pipeline calls [`WebhookDispatcher::notify`] wherever it records a
//! telemetry event. Notifications go into a bounded queue (oldest dropped on
//! overflow) and a single background task delivers them, so request handling
//! never waits on a webhook endpoint.

use crate::domain::{RouteName, WebhookEndpoint, WebhookEventType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crossbeam::queue::ArrayQueue;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Prompt excerpts are cut to this many characters
pub const PROMPT_EXCERPT_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub event: WebhookEventType,
    pub timestamp: DateTime<Utc>,
    pub request_id: Option<String>,
    pub tenant: Option<String>,
    pub route: String,
    pub model: Option<String>,
    /// `allowed` or `blocked`
    pub decision: String,
    pub reason: Option<String>,
    pub est_cost_usd: f64,
    pub actual_cost_usd: Option<f64>,
    pub tenant_spend_usd: f64,
    pub route_spend_usd: f64,
    pub redaction_mode: String,
    pub drift_detected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_excerpt: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WebhookDelivery {
    pub id: Uuid,
    pub url: String,
    pub payload: WebhookPayload,
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("webhook request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("webhook endpoint {url} answered {status}")]
    Status { url: String, status: u16 },
}

/// Where deliveries end up; HMAC signing and retries live behind this seam
#[async_trait]
pub trait WebhookSink: Send + Sync {
    async fn deliver(&self, delivery: &WebhookDelivery) -> Result<(), WebhookError>;
}

/// POSTs the payload as JSON
#[derive(Debug, Clone)]
pub struct HttpWebhookSink {
    client: reqwest::Client,
}

impl HttpWebhookSink {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookSink for HttpWebhookSink {
    async fn deliver(&self, delivery: &WebhookDelivery) -> Result<(), WebhookError> {
        let response = self
            .client
            .post(&delivery.url)
            .header("x-tollbooth-delivery", delivery.id.to_string())
            .json(&delivery.payload)
            .send()
            .await
            .map_err(|source| WebhookError::Transport {
                url: delivery.url.clone(),
                source,
            })?;
        if !response.status().is_success() {
            return Err(WebhookError::Status {
                url: delivery.url.clone(),
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

fn excerpt(text: &str) -> String {
    text.chars().take(PROMPT_EXCERPT_CHARS).collect()
}

#[derive(Debug)]
pub struct WebhookDispatcher {
    endpoints: Vec<WebhookEndpoint>,
    queue: Arc<ArrayQueue<WebhookDelivery>>,
    wakeup: Arc<Notify>,
    dropped: AtomicU64,
}

impl WebhookDispatcher {
    pub fn new(endpoints: Vec<WebhookEndpoint>, capacity: usize) -> Self {
        Self {
            endpoints,
            queue: Arc::new(ArrayQueue::new(capacity.max(1))),
            wakeup: Arc::new(Notify::new()),
            dropped: AtomicU64::new(0),
        }
    }

    /// Dispatcher with no endpoints; every notification is a no-op
    pub fn disabled() -> Self {
        Self::new(Vec::new(), 1)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Queue the payload for every endpoint listening to this route and event.
    ///
    /// `sanitized_text` is only attached for endpoints that opted into prompt
    /// excerpts, and only ever holds post-redaction content.
    pub fn notify(&self, route: &RouteName, payload: WebhookPayload, sanitized_text: Option<&str>) {
        let mut queued = false;
        for endpoint in self
            .endpoints
            .iter()
            .filter(|endpoint| endpoint.accepts(route, payload.event))
        {
            let mut payload = payload.clone();
            if endpoint.include_prompt_excerpt {
                payload.prompt_excerpt = sanitized_text.map(excerpt);
            }
            let delivery = WebhookDelivery {
                id: Uuid::now_v7(),
                url: endpoint.url.clone(),
                payload,
            };
            if let Some(old) = self.queue.force_push(delivery) {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(url = %old.url, "Webhook queue full, oldest delivery dropped");
            }
            queued = true;
        }
        if queued {
            self.wakeup.notify_one();
        }
    }

    /// Background task delivering queued notifications through `sink`
    pub fn worker(&self, sink: Arc<dyn WebhookSink>) -> (WebhookWorker, mpsc::Sender<()>) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let worker = WebhookWorker {
            queue: Arc::clone(&self.queue),
            wakeup: Arc::clone(&self.wakeup),
            sink,
            shutdown_rx,
        };
        (worker, shutdown_tx)
    }
}

pub struct WebhookWorker {
    queue: Arc<ArrayQueue<WebhookDelivery>>,
    wakeup: Arc<Notify>,
    sink: Arc<dyn WebhookSink>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl WebhookWorker {
    pub async fn run(mut self) {
        info!("Webhook worker started");
        loop {
            self.deliver_pending().await;
            tokio::select! {
                _ = self.wakeup.notified() => {}
                _ = self.shutdown_rx.recv() => {
                    info!("Webhook worker shutting down");
                    break;
                }
            }
        }
        self.deliver_pending().await;
        info!("Webhook worker stopped");
    }

    /// Deliver everything queued; returns how many deliveries succeeded
    pub async fn deliver_pending(&self) -> usize {
        let mut delivered = 0;
        while let Some(delivery) = self.queue.pop() {
            match self.sink.deliver(&delivery).await {
                Ok(()) => {
                    delivered += 1;
                    debug!(url = %delivery.url, event = delivery.payload.event.as_str(), "Webhook delivered");
                }
                Err(err) => warn!(error = %err, "Webhook delivery failed"),
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        deliveries: Mutex<Vec<WebhookDelivery>>,
    }

    #[async_trait]
    impl WebhookSink for RecordingSink {
        async fn deliver(&self, delivery: &WebhookDelivery) -> Result<(), WebhookError> {
            self.deliveries.lock().push(delivery.clone());
            Ok(())
        }
    }

    fn route(name: &str) -> RouteName {
        RouteName::try_new(name.to_string()).unwrap()
    }

    fn payload(event: WebhookEventType) -> WebhookPayload {
        WebhookPayload {
            event,
            timestamp: Utc::now(),
            request_id: None,
            tenant: Some("acme".to_string()),
            route: "chat".to_string(),
            model: Some("gpt-4o".to_string()),
            decision: "blocked".to_string(),
            reason: Some("budget_exceeded".to_string()),
            est_cost_usd: 0.0,
            actual_cost_usd: None,
            tenant_spend_usd: 6.0,
            route_spend_usd: 6.0,
            redaction_mode: "warn".to_string(),
            drift_detected: false,
            prompt_excerpt: None,
        }
    }

    fn endpoint(url: &str, routes: &[&str], excerpt: bool) -> WebhookEndpoint {
        WebhookEndpoint {
            url: url.to_string(),
            routes: routes.iter().map(|r| route(r)).collect(),
            events: vec![],
            include_prompt_excerpt: excerpt,
        }
    }

    #[tokio::test]
    async fn notifications_fan_out_to_matching_endpoints() {
        let dispatcher = WebhookDispatcher::new(
            vec![
                endpoint("http://a.local", &[], true),
                endpoint("http://b.local", &["embed"], false),
            ],
            16,
        );
        let sink = Arc::new(RecordingSink::default());
        let (worker, _shutdown) = dispatcher.worker(sink.clone());

        let long_text = "x".repeat(500);
        dispatcher.notify(
            &route("chat"),
            payload(WebhookEventType::RequestBlocked),
            Some(&long_text),
        );
        assert_eq!(worker.deliver_pending().await, 1);

        let deliveries = sink.deliveries.lock();
        assert_eq!(deliveries[0].url, "http://a.local");
        assert_eq!(
            deliveries[0].payload.prompt_excerpt.as_ref().map(|e| e.len()),
            Some(PROMPT_EXCERPT_CHARS)
        );
    }

    #[tokio::test]
    async fn full_queue_drops_oldest() {
        let dispatcher = WebhookDispatcher::new(vec![endpoint("http://a.local", &[], false)], 2);
        for _ in 0..3 {
            dispatcher.notify(&route("chat"), payload(WebhookEventType::RequestCompleted), None);
        }
        assert_eq!(dispatcher.dropped(), 1);
    }

    #[tokio::test]
    async fn worker_drains_on_shutdown() {
        let dispatcher = WebhookDispatcher::new(vec![endpoint("http://a.local", &[], false)], 8);
        let sink = Arc::new(RecordingSink::default());
        let (worker, shutdown) = dispatcher.worker(sink.clone());
        let handle = tokio::spawn(worker.run());

        dispatcher.notify(&route("chat"), payload(WebhookEventType::ProviderError), None);
        shutdown.send(()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sink.deliveries.lock().len(), 1);
    }

    #[tokio::test]
    async fn http_sink_posts_json() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .match_header("content-type", "application/json")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "event": "request_blocked",
                "reason": "budget_exceeded"
            })))
            .with_status(204)
            .create_async()
            .await;

        let sink = HttpWebhookSink::new(DEFAULT_DELIVERY_TIMEOUT).unwrap();
        let delivery = WebhookDelivery {
            id: Uuid::now_v7(),
            url: format!("{}/hook", server.url()),
            payload: payload(WebhookEventType::RequestBlocked),
        };
        sink.deliver(&delivery).await.unwrap();
        mock.assert_async().await;
    }
}
