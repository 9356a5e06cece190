use config::{Config, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub use config::ConfigError;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub gateway: GatewaySettings,
    pub telemetry: TelemetrySettings,
    pub webhooks: WebhookSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub environment: String,
    pub max_body_bytes: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewaySettings {
    /// Hydrated gateway config (tenants, routes, callers) as JSON
    pub config_path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelemetrySettings {
    /// JSON-lines event store; events stay in memory when unset
    #[serde(default)]
    pub store_path: Option<PathBuf>,
    pub flush_interval_ms: u64,
    pub buffer_capacity: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebhookSettings {
    pub queue_capacity: usize,
    pub delivery_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
    pub format: String,
}

impl TelemetrySettings {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl WebhookSettings {
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("server.environment", environment.clone())?
            .set_default("server.max_body_bytes", 2 * 1024 * 1024)?
            .set_default("gateway.config_path", "config/gateway.json")?
            .set_default("telemetry.flush_interval_ms", 100)?
            .set_default("telemetry.buffer_capacity", 8192)?
            .set_default("webhooks.queue_capacity", 1024)?
            .set_default("webhooks.delivery_timeout_ms", 5000)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "json")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{environment}")).required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(Environment::with_prefix("TOLLBOOTH").separator("__"))
            .build()?;

        config.try_deserialize()
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
