//! Caller resolver and route catalog
//!
//! Built once from the hydrated config. Lookups are pure and lock-free; the
//! catalog never changes for the lifetime of the process.

use crate::domain::{
    CallerRecord, GatewayConfig, ProviderKind, Route, RouteName, ServiceLabel, ServiceToken,
    Tenant, TenantName, WebhookEndpoint,
};
use crate::policy::redaction::{RedactionError, Redactor};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("duplicate tenant '{0}'")]
    DuplicateTenant(TenantName),

    #[error("duplicate route '{0}'")]
    DuplicateRoute(RouteName),

    #[error("duplicate caller token for service '{0}'")]
    DuplicateToken(ServiceLabel),

    #[error("tenant '{0}' has an invalid daily spend cap")]
    InvalidTenantCap(TenantName),

    #[error("route '{0}' has an invalid daily budget")]
    InvalidRouteBudget(RouteName),

    #[error("route '{0}' uses an openai_compatible provider without a base_url")]
    MissingBaseUrl(RouteName),

    #[error("route '{route}': {source}")]
    Redaction {
        route: RouteName,
        #[source]
        source: RedactionError,
    },
}

/// Identity a service token resolves to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerContext {
    pub service_label: ServiceLabel,
    pub tenant: TenantName,
    pub allowed_routes: HashSet<RouteName>,
}

impl CallerContext {
    pub fn may_use(&self, route: &RouteName) -> bool {
        self.allowed_routes.contains(route)
    }
}

impl From<&CallerRecord> for CallerContext {
    fn from(record: &CallerRecord) -> Self {
        Self {
            service_label: record.service_label.clone(),
            tenant: record.tenant.clone(),
            allowed_routes: record.allowed_routes.iter().cloned().collect(),
        }
    }
}

/// A route with its redaction rules compiled
#[derive(Debug, Clone)]
pub struct CatalogRoute {
    pub route: Route,
    pub redactor: Redactor,
}

impl CatalogRoute {
    pub fn name(&self) -> &RouteName {
        &self.route.name
    }
}

#[derive(Debug, Clone)]
pub struct RouteCatalog {
    tenants: HashMap<TenantName, Tenant>,
    routes: HashMap<RouteName, Arc<CatalogRoute>>,
    callers: HashMap<ServiceToken, Arc<CallerContext>>,
    webhooks: Vec<WebhookEndpoint>,
    checksum: String,
}

impl RouteCatalog {
    pub fn from_config(config: &GatewayConfig) -> Result<Self, CatalogError> {
        let mut tenants = HashMap::new();
        for tenant in &config.tenants {
            if !tenant.daily_spend_cap_usd.is_finite() || tenant.daily_spend_cap_usd < 0.0 {
                return Err(CatalogError::InvalidTenantCap(tenant.name.clone()));
            }
            if tenants.insert(tenant.name.clone(), tenant.clone()).is_some() {
                return Err(CatalogError::DuplicateTenant(tenant.name.clone()));
            }
        }

        let mut routes = HashMap::new();
        for route in &config.routes {
            if route.provider.kind == ProviderKind::OpenaiCompatible
                && route.provider.base_url.is_none()
            {
                return Err(CatalogError::MissingBaseUrl(route.name.clone()));
            }
            let policy = route.policy.as_ref();
            if let Some(budget) = policy.and_then(|p| p.budget_daily_usd) {
                if !budget.is_finite() || budget < 0.0 {
                    return Err(CatalogError::InvalidRouteBudget(route.name.clone()));
                }
            }
            // Left to the evaluator, which answers unknown_tenant at request time
            if !tenants.contains_key(&route.tenant) {
                warn!(route = %route.name, tenant = %route.tenant, "Route references an unknown tenant");
            }

            let patterns = policy
                .map(|p| p.redaction.patterns.as_slice())
                .unwrap_or_default();
            let redactor =
                Redactor::compile(patterns).map_err(|source| CatalogError::Redaction {
                    route: route.name.clone(),
                    source,
                })?;
            let entry = Arc::new(CatalogRoute {
                route: route.clone(),
                redactor,
            });
            if routes.insert(route.name.clone(), entry).is_some() {
                return Err(CatalogError::DuplicateRoute(route.name.clone()));
            }
        }

        let mut callers = HashMap::new();
        for caller in &config.callers {
            let context = Arc::new(CallerContext::from(caller));
            if callers.insert(caller.token.clone(), context).is_some() {
                return Err(CatalogError::DuplicateToken(caller.service_label.clone()));
            }
        }

        Ok(Self {
            tenants,
            routes,
            callers,
            webhooks: config.webhooks.clone(),
            checksum: config.checksum(),
        })
    }

    /// Resolve a bearer token to its caller identity
    pub fn resolve_caller(&self, token: &str) -> Option<Arc<CallerContext>> {
        let token = ServiceToken::try_new(token.to_string()).ok()?;
        self.callers.get(&token).cloned()
    }

    pub fn route(&self, name: &RouteName) -> Option<Arc<CatalogRoute>> {
        self.routes.get(name).cloned()
    }

    pub fn tenant(&self, name: &TenantName) -> Option<&Tenant> {
        self.tenants.get(name)
    }

    pub fn routes(&self) -> impl Iterator<Item = &Arc<CatalogRoute>> {
        self.routes.values()
    }

    pub fn webhooks(&self) -> &[WebhookEndpoint] {
        &self.webhooks
    }

    /// Checksum of the config this catalog was built from
    pub fn checksum(&self) -> &str {
        &self.checksum
    }
}
