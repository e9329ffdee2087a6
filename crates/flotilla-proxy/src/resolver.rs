//! Route resolution — slug to backend URL across both deployment kinds.
//!
//! One query shape: the service by slug, with its most recent active
//! deployment of each kind. The marketplace URI wins when both backends
//! expose one; the TEE URL is the fallback.

use async_trait::async_trait;

use flotilla_state::{MarketDeploymentStatus, StateStore, TeeDeploymentStatus};

use crate::error::RouteError;

/// A successfully resolved route.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRoute {
    pub target_url: String,
    /// Native status of the backend that won the resolution.
    pub native_status: String,
}

/// Resolves a slug to its currently serving backend.
#[async_trait]
pub trait RouteResolver: Send + Sync {
    async fn resolve(&self, slug: &str) -> Result<ResolvedRoute, RouteError>;
}

/// `RouteResolver` backed by the state store.
pub struct StoreResolver {
    store: StateStore,
}

impl StoreResolver {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RouteResolver for StoreResolver {
    async fn resolve(&self, slug: &str) -> Result<ResolvedRoute, RouteError> {
        let service = self
            .store
            .get_service_by_slug(slug)
            .map_err(|e| RouteError::Store(e.to_string()))?
            .ok_or_else(|| RouteError::UnknownSlug(slug.to_string()))?;

        let market = self
            .store
            .active_market_deployment(&service.id)
            .map_err(|e| RouteError::Store(e.to_string()))?
            // Suspended deployments are paused for billing, not routable.
            .filter(|d| d.status == MarketDeploymentStatus::Active);
        let tee = self
            .store
            .active_tee_deployment(&service.id)
            .map_err(|e| RouteError::Store(e.to_string()))?
            .filter(|d| d.status == TeeDeploymentStatus::Active);

        if market.is_none() && tee.is_none() {
            return Err(RouteError::NoActiveDeployment(slug.to_string()));
        }

        // Marketplace URI preferred over the TEE URL when both exist.
        if let Some(dep) = &market {
            if let Some(url) = dep.first_url() {
                return Ok(ResolvedRoute {
                    target_url: ensure_scheme(url),
                    native_status: dep.status.as_native().to_string(),
                });
            }
        }
        if let Some(dep) = &tee {
            if let Some(url) = dep.app_url.as_deref() {
                return Ok(ResolvedRoute {
                    target_url: ensure_scheme(url),
                    native_status: dep.status.as_native().to_string(),
                });
            }
        }

        // Something is active but nothing is reachable yet.
        Err(RouteError::NotReady(slug.to_string()))
    }
}

/// Marketplace URIs often arrive scheme-less (`host:port`); default http.
fn ensure_scheme(url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("http://{url}")
    }
}
