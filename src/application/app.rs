use crate::config::Settings;
use crate::domain::GatewayConfig;
use crate::providers::ProviderRegistry;
use crate::proxy::{GatewayContext, GatewayService, RequestPipeline};
use crate::telemetry::{
    HttpWebhookSink, JsonlTelemetryStore, MemoryTelemetryStore, TelemetryRecorder,
    TelemetryStore, TelemetryWriter, WebhookDispatcher,
};
use crate::Result;
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, instrument};

/// Main application struct that coordinates all components
pub struct Application {
    settings: Settings,
    context: Arc<GatewayContext>,
    store: Arc<dyn TelemetryStore>,
}

impl Application {
    #[instrument]
    pub async fn new() -> Result<Self> {
        let settings = Settings::new()?;
        Self::from_settings(settings).await
    }

    /// Load the hydrated gateway config and telemetry store named in `settings`
    pub async fn from_settings(settings: Settings) -> Result<Self> {
        info!(path = %settings.gateway.config_path.display(), "Loading gateway config");
        let gateway = GatewayConfig::from_path(&settings.gateway.config_path).await?;
        let store: Arc<dyn TelemetryStore> = match &settings.telemetry.store_path {
            Some(path) => Arc::new(JsonlTelemetryStore::new(path.clone())),
            None => Arc::new(MemoryTelemetryStore::new()),
        };
        Self::build(settings, &gateway, store).await
    }

    /// Assemble the gateway state and replay today's spend into the ledger
    pub async fn build(
        settings: Settings,
        gateway: &GatewayConfig,
        store: Arc<dyn TelemetryStore>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder().build()?;
        let recorder = Arc::new(TelemetryRecorder::new(settings.telemetry.buffer_capacity));
        let webhooks = Arc::new(WebhookDispatcher::new(
            gateway.webhooks.clone(),
            settings.webhooks.queue_capacity,
        ));
        let context = GatewayContext::new(
            gateway,
            ProviderRegistry::with_defaults(client),
            recorder,
            webhooks,
        )?;

        let rows = store.load_today_rows().await?;
        context.ledger.rebuild_from_rows(&rows);
        info!(
            checksum = context.checksum(),
            routes = context.catalog.routes().count(),
            replayed = rows.len(),
            "Gateway state ready"
        );

        Ok(Self {
            settings,
            context: Arc::new(context),
            store,
        })
    }

    pub fn router(&self) -> Router {
        let pipeline = RequestPipeline::new(Arc::clone(&self.context));
        GatewayService::new(pipeline, self.settings.server.max_body_bytes).into_router()
    }

    /// Serve until ctrl-c, then drain telemetry and stop webhook delivery
    #[instrument(skip(self))]
    pub async fn run(self) -> Result<()> {
        let (writer, writer_shutdown) = TelemetryWriter::new(
            Arc::clone(&self.context.recorder),
            Arc::clone(&self.store),
            self.settings.telemetry.flush_interval(),
        );
        let writer_task = tokio::spawn(writer.run());

        let sink = Arc::new(HttpWebhookSink::new(
            self.settings.webhooks.delivery_timeout(),
        )?);
        let (worker, worker_shutdown) = self.context.webhooks.worker(sink);
        let worker_task = tokio::spawn(worker.run());

        let address = self.settings.bind_address();
        let listener = TcpListener::bind(&address).await?;
        info!(address = %address, "Starting Tollbooth gateway");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!("Server stopped, draining background tasks");
        let _ = writer_shutdown.send(()).await;
        if let Err(err) = writer_task.await {
            error!(error = %err, "Telemetry writer task failed");
        }
        let _ = worker_shutdown.send(()).await;
        if let Err(err) = worker_task.await {
            error!(error = %err, "Webhook worker task failed");
        }

        info!("Application stopped");
        Ok(())
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn context(&self) -> &Arc<GatewayContext> {
        &self.context
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "Failed to listen for ctrl-c; running until killed");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
