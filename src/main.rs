use anyhow::Result;
use tollbooth::config::{LoggingSettings, Settings};
use tollbooth::Application;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_tracing(logging: &LoggingSettings) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    if logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(filter)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::new()?;
    init_tracing(&settings.logging);

    info!(environment = %settings.server.environment, "Starting Tollbooth");

    let app = Application::from_settings(settings).await?;
    app.run().await?;

    Ok(())
}
