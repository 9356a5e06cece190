use crate::domain::GatewayConfigError;
use crate::policy::CatalogError;
use crate::telemetry::StoreError;
use thiserror::Error;

/// Startup and lifecycle errors of the gateway process
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Gateway config error: {0}")]
    GatewayConfig(#[from] GatewayConfigError),

    #[error("Invalid gateway config: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Telemetry store error: {0}")]
    Store(#[from] StoreError),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
