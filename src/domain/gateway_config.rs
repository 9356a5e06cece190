//! Hydrated gateway configuration
//!
//! This is the read-only record produced by the external hydration step
//! (policy file parsing, decryption, secret resolution). The gateway loads it once
//! at startup and never mutates it.

use crate::domain::identifiers::{
    ModelName, ProviderApiKey, RouteName, ServiceLabel, ServiceToken, TenantName,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::path::Path;
use thiserror::Error;

/// Upstream API family of a route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Openai,
    OpenaiCompatible,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Openai => "openai",
            Self::OpenaiCompatible => "openai_compatible",
        }
    }
}

/// Which OpenAI-compatible endpoint a route serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointType {
    Chat,
    Embeddings,
}

impl EndpointType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Embeddings => "embeddings",
        }
    }

    /// Path segment appended to the provider base URL
    pub fn upstream_path(&self) -> &'static str {
        match self {
            Self::Chat => "/chat/completions",
            Self::Embeddings => "/embeddings",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderBinding {
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    pub model: ModelName,
    pub endpoint_type: EndpointType,
    #[serde(default)]
    pub default_params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<ProviderApiKey>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedactionMode {
    #[default]
    Off,
    Warn,
    Block,
}

impl RedactionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Warn => "warn",
            Self::Block => "block",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RedactionSettings {
    #[serde(default)]
    pub mode: RedactionMode,
    #[serde(default)]
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftSensitivity {
    /// Model prefix match only; fingerprints ignored
    Low,
    /// Model prefix match plus fingerprint tracking
    #[default]
    Medium,
    /// Exact model match plus fingerprint tracking
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftDetectionSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub sensitivity: DriftSensitivity,
    /// Allowed relative difference between realized and estimated cost (0.5 = 50%)
    #[serde(default = "default_cost_anomaly_threshold")]
    pub cost_anomaly_threshold: f64,
}

fn default_cost_anomaly_threshold() -> f64 {
    0.5
}

impl Default for DriftDetectionSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            sensitivity: DriftSensitivity::default(),
            cost_anomaly_threshold: default_cost_anomaly_threshold(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutePolicy {
    #[serde(default)]
    pub max_tokens_in: Option<u32>,
    #[serde(default)]
    pub max_tokens_out: Option<u32>,
    #[serde(default)]
    pub budget_daily_usd: Option<f64>,
    #[serde(default)]
    pub drift_strict: bool,
    #[serde(default)]
    pub drift_detection: DriftDetectionSettings,
    #[serde(default)]
    pub redaction: RedactionSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_max_elapsed_ms")]
    pub max_elapsed_ms: u64,
    #[serde(default)]
    pub jitter: bool,
    #[serde(default = "default_retry_on")]
    pub retry_on: Vec<u16>,
    /// Deadline for a single upstream attempt
    #[serde(default)]
    pub attempt_timeout_ms: Option<u64>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_ms() -> u64 {
    200
}

fn default_max_elapsed_ms() -> u64 {
    10_000
}

fn default_retry_on() -> Vec<u16> {
    vec![429, 500, 502, 503, 504]
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_ms: default_base_ms(),
            max_elapsed_ms: default_max_elapsed_ms(),
            jitter: false,
            retry_on: default_retry_on(),
            attempt_timeout_ms: None,
        }
    }
}

impl RetrySettings {
    /// Routes without a `retries` block make exactly one attempt
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default)]
    pub include_params: bool,
}

fn default_ttl_ms() -> u64 {
    60_000
}

fn default_max_entries() -> usize {
    256
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_ms: default_ttl_ms(),
            max_entries: default_max_entries(),
            include_params: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub name: TenantName,
    pub daily_spend_cap_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub name: RouteName,
    pub tenant: TenantName,
    pub provider: ProviderBinding,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<RoutePolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<RetrySettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheSettings>,
}

impl Route {
    pub fn redaction_mode(&self) -> RedactionMode {
        self.policy
            .as_ref()
            .map(|policy| policy.redaction.mode)
            .unwrap_or_default()
    }

    pub fn retry_settings(&self) -> RetrySettings {
        self.retries
            .clone()
            .unwrap_or_else(RetrySettings::single_attempt)
    }

    pub fn cache_settings(&self) -> Option<&CacheSettings> {
        self.cache.as_ref().filter(|cache| cache.enabled)
    }
}

/// A pre-provisioned service credential
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallerRecord {
    pub token: ServiceToken,
    pub service_label: ServiceLabel,
    pub tenant: TenantName,
    #[serde(default)]
    pub allowed_routes: Vec<RouteName>,
}

/// Price override for one provider/model pair, in USD per token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingOverride {
    pub provider: ProviderKind,
    pub model: String,
    pub input_usd_per_token: Decimal,
    pub output_usd_per_token: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventType {
    RequestBlocked,
    RequestCompleted,
    RequestCacheHit,
    ProviderError,
}

impl WebhookEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestBlocked => "request_blocked",
            Self::RequestCompleted => "request_completed",
            Self::RequestCacheHit => "request_cache_hit",
            Self::ProviderError => "provider_error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEndpoint {
    pub url: String,
    /// Routes this endpoint listens to; empty means all routes
    #[serde(default)]
    pub routes: Vec<RouteName>,
    /// Event types this endpoint listens to; empty means all events
    #[serde(default)]
    pub events: Vec<WebhookEventType>,
    #[serde(default)]
    pub include_prompt_excerpt: bool,
}

impl WebhookEndpoint {
    pub fn accepts(&self, route: &RouteName, event: WebhookEventType) -> bool {
        (self.routes.is_empty() || self.routes.contains(route))
            && (self.events.is_empty() || self.events.contains(&event))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub tenants: Vec<Tenant>,
    pub routes: Vec<Route>,
    pub callers: Vec<CallerRecord>,
    #[serde(default)]
    pub pricing: Vec<PricingOverride>,
    #[serde(default)]
    pub webhooks: Vec<WebhookEndpoint>,
}

#[derive(Debug, Error)]
pub enum GatewayConfigError {
    #[error("failed to read gateway config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid gateway config: {0}")]
    Parse(#[from] serde_json::Error),
}

impl GatewayConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, GatewayConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, GatewayConfigError> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| GatewayConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
        Self::from_json_str(&raw)
    }

    /// SHA-256 over the canonical JSON form, identifying this config version
    pub fn checksum(&self) -> String {
        let canonical = serde_json::to_value(self)
            .map(|value| crate::domain::canonical_json(&value))
            .unwrap_or_default();
        hex::encode(Sha256::digest(canonical.as_bytes()))
    }
}
