//! flotilla-api — REST surface for the control plane.
//!
//! The only way external collaborators (the CRUD layer, the billing
//! webhook) drive deployments: everything goes through the shared provider
//! contract, never an orchestrator directly.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/healthz` | Liveness |
//! | GET | `/api/v1/providers` | Registered providers + capabilities |
//! | POST | `/api/v1/services/{id}/deploy` | Deploy a service via a named provider |
//! | GET | `/api/v1/deployments/{provider}/{id}/status` | Canonical + native status |
//! | GET | `/api/v1/deployments/{provider}/{id}/logs` | Workload logs |
//! | POST | `/api/v1/deployments/{provider}/{id}/stop` | Pause (where supported) |
//! | POST | `/api/v1/deployments/{provider}/{id}/start` | Resume in place |
//! | POST | `/api/v1/deployments/{provider}/{id}/close` | Tear down for good |
//! | POST | `/api/v1/billing/topup` | Balance top-up → resume-if-funded |
//! | POST | `/api/v1/billing/pause` | Pause an organization's deployments |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use flotilla_escrow::EscrowLedger;
use flotilla_provider::ProviderRegistry;
use flotilla_proxy::SubdomainRouter;
use flotilla_state::StateStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub registry: Arc<ProviderRegistry>,
    pub ledger: Arc<EscrowLedger>,
    /// Deploy/close invalidate the slug's cached route.
    pub proxy: Option<Arc<SubdomainRouter>>,
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/providers", get(handlers::list_providers))
        .route("/services/{id}/deploy", post(handlers::deploy_service))
        .route(
            "/deployments/{provider}/{id}/status",
            get(handlers::deployment_status),
        )
        .route(
            "/deployments/{provider}/{id}/logs",
            get(handlers::deployment_logs),
        )
        .route(
            "/deployments/{provider}/{id}/stop",
            post(handlers::stop_deployment),
        )
        .route(
            "/deployments/{provider}/{id}/start",
            post(handlers::start_deployment),
        )
        .route(
            "/deployments/{provider}/{id}/close",
            post(handlers::close_deployment),
        )
        .route("/billing/topup", post(handlers::billing_topup))
        .route("/billing/pause", post(handlers::billing_pause))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::healthz))
}
