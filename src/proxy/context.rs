//! Process-wide gateway state, built once at startup and shared by every
//! request

use crate::domain::GatewayConfig;
use crate::policy::{BudgetLedger, CatalogError, DriftDetector, PriceTable, RouteCatalog};
use crate::providers::ProviderRegistry;
use crate::proxy::cache::CacheRegistry;
use crate::telemetry::{TelemetryRecorder, WebhookDispatcher};
use std::sync::Arc;

pub struct GatewayContext {
    pub catalog: Arc<RouteCatalog>,
    pub ledger: Arc<BudgetLedger>,
    pub pricing: Arc<PriceTable>,
    pub caches: CacheRegistry,
    pub drift: DriftDetector,
    pub providers: Arc<ProviderRegistry>,
    pub recorder: Arc<TelemetryRecorder>,
    pub webhooks: Arc<WebhookDispatcher>,
}

impl GatewayContext {
    /// Validate the hydrated config and assemble fresh state around it.
    ///
    /// The ledger starts empty; callers replay persisted telemetry into it
    /// before serving traffic.
    pub fn new(
        config: &GatewayConfig,
        providers: ProviderRegistry,
        recorder: Arc<TelemetryRecorder>,
        webhooks: Arc<WebhookDispatcher>,
    ) -> Result<Self, CatalogError> {
        Ok(Self {
            catalog: Arc::new(RouteCatalog::from_config(config)?),
            ledger: Arc::new(BudgetLedger::new()),
            pricing: Arc::new(PriceTable::with_overrides(&config.pricing)),
            caches: CacheRegistry::new(),
            drift: DriftDetector::new(),
            providers: Arc::new(providers),
            recorder,
            webhooks,
        })
    }

    pub fn checksum(&self) -> &str {
        self.catalog.checksum()
    }
}

impl std::fmt::Debug for GatewayContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayContext")
            .field("checksum", &self.checksum())
            .finish_non_exhaustive()
    }
}
