//! OpenAI and OpenAI-compatible chat completions / embeddings adapter

use crate::domain::{GatewayRequest, ProviderKind, Route};
use crate::providers::constants::{json_fields, urls};
use crate::providers::{
    BufferedResponse, ProviderAdapter, ProviderError, ResponseMetadata, StreamingResponse,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{Map, Value};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct OpenAiAdapter {
    kind: ProviderKind,
    client: reqwest::Client,
}

impl OpenAiAdapter {
    pub fn new(kind: ProviderKind, client: reqwest::Client) -> Self {
        Self { kind, client }
    }

    fn endpoint_url(route: &Route) -> String {
        let base = route
            .provider
            .base_url
            .as_deref()
            .unwrap_or(urls::OPENAI_BASE_URL)
            .trim_end_matches('/');
        format!("{base}{}", route.provider.endpoint_type.upstream_path())
    }

    /// Upstream body: sanitized content, merged params, the route's model
    pub fn build_body(route: &Route, request: &GatewayRequest, stream: bool) -> Value {
        let mut body: Map<String, Value> = request.params.clone();
        body.extend(request.payload.to_json_fields());
        body.insert(
            json_fields::MODEL.to_string(),
            Value::String(route.provider.model.to_string()),
        );
        if stream {
            body.insert(json_fields::STREAM.to_string(), Value::Bool(true));
            let options = body
                .entry(json_fields::STREAM_OPTIONS.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(options) = options {
                options.insert(json_fields::INCLUDE_USAGE.to_string(), Value::Bool(true));
            } else {
                *options = serde_json::json!({ json_fields::INCLUDE_USAGE: true });
            }
        } else {
            body.remove(json_fields::STREAM_OPTIONS);
        }
        Value::Object(body)
    }

    async fn post(
        &self,
        route: &Route,
        body: &Value,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = Self::endpoint_url(route);
        let mut request = self.client.post(&url).json(body);
        if let Some(key) = &route.provider.api_key {
            let key: &str = key.as_ref();
            request = request.bearer_auth(key);
        }
        debug!(url = %url, route = %route.name, "Calling provider");

        let response = request
            .send()
            .await
            .map_err(|err| ProviderError::Network(err.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .bytes()
            .await
            .map_err(|err| ProviderError::Network(err.to_string()))?;
        Err(ProviderError::from_status(status.as_u16(), &body))
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn send(
        &self,
        route: &Route,
        request: &GatewayRequest,
    ) -> Result<BufferedResponse, ProviderError> {
        let body = Self::build_body(route, request, false);
        let response = self.post(route, &body).await?;
        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| ProviderError::Network(err.to_string()))?;
        let parsed: Value = serde_json::from_slice(&bytes)
            .map_err(|err| ProviderError::InvalidResponse(err.to_string()))?;

        Ok(BufferedResponse {
            status,
            metadata: ResponseMetadata::from_json(&parsed),
            body: bytes,
        })
    }

    async fn open_stream(
        &self,
        route: &Route,
        request: &GatewayRequest,
    ) -> Result<StreamingResponse, ProviderError> {
        let body = Self::build_body(route, request, true);
        let response = self.post(route, &body).await?;
        let status = response.status().as_u16();
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|err| ProviderError::Network(err.to_string())));

        Ok(StreamingResponse {
            status,
            body: stream.boxed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChatMessage, EndpointType, GatewayConfig, RequestPayload};
    use serde_json::json;

    fn route(base_url: &str) -> Route {
        let config = json!({
            "tenants": [],
            "routes": [{
                "name": "chat",
                "tenant": "acme",
                "provider": {
                    "type": "openai_compatible",
                    "model": "llama-3-8b",
                    "endpoint_type": "chat",
                    "base_url": base_url,
                    "api_key": "sk-test-key"
                }
            }],
            "callers": []
        });
        GatewayConfig::from_json_str(&config.to_string())
            .unwrap()
            .routes
            .remove(0)
    }

    fn request() -> GatewayRequest {
        let mut params = Map::new();
        params.insert("temperature".to_string(), json!(0.2));
        GatewayRequest {
            payload: RequestPayload::Chat {
                messages: vec![ChatMessage::new("user", "hello")],
            },
            params,
            stream: false,
        }
    }

    #[test]
    fn body_uses_route_model_and_requests_stream_usage() {
        let body = OpenAiAdapter::build_body(&route("http://x"), &request(), true);
        assert_eq!(body["model"], "llama-3-8b");
        assert_eq!(body["temperature"], 0.2);
        assert_eq!(body["messages"][0]["content"], "hello");
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);

        let buffered = OpenAiAdapter::build_body(&route("http://x"), &request(), false);
        assert!(buffered.get("stream").is_none());
    }

    #[test]
    fn body_carries_tool_call_turns_upstream() {
        let messages = json!([
            {"role": "user", "content": "weather?"},
            {
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": {"name": "weather", "arguments": "{}"}
                }]
            },
            {"role": "tool", "tool_call_id": "call_1", "content": "sunny"}
        ]);
        let raw = json!({"messages": messages, "tools": []}).to_string();
        let parsed = GatewayRequest::parse_body(EndpointType::Chat, raw.as_bytes()).unwrap();

        let body = OpenAiAdapter::build_body(&route("http://x"), &parsed.request, false);
        assert_eq!(body["messages"], messages);
        assert_eq!(body["messages"][2]["tool_call_id"], "call_1");
        assert_eq!(body["tools"], json!([]));
    }

    #[tokio::test]
    async fn send_parses_metadata_and_authenticates() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer sk-test-key")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "id": "chatcmpl-1",
                    "model": "llama-3-8b",
                    "system_fingerprint": "fp_1",
                    "choices": [],
                    "usage": {"prompt_tokens": 3, "completion_tokens": 7}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let adapter = OpenAiAdapter::new(ProviderKind::OpenaiCompatible, reqwest::Client::new());
        let response = adapter
            .send(&route(&format!("{}/v1", server.url())), &request())
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.metadata.completion_tokens, Some(7));
        assert_eq!(response.metadata.system_fingerprint.as_deref(), Some("fp_1"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn upstream_errors_are_classified() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(429)
            .with_body(r#"{"error": {"message": "slow down", "code": "rate_limit"}}"#)
            .create_async()
            .await;

        let adapter = OpenAiAdapter::new(ProviderKind::OpenaiCompatible, reqwest::Client::new());
        let err = adapter.send(&route(&server.url()), &request()).await.unwrap_err();
        assert_eq!(
            err,
            ProviderError::Status {
                status: 429,
                code: Some("rate_limit".to_string()),
                message: "slow down".to_string()
            }
        );
    }
}
