//! REST API handlers.
//!
//! Each handler resolves a provider from the registry and drives it through
//! the shared contract, returning JSON responses in a consistent envelope.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use tracing::{info, warn};

use flotilla_provider::{Capabilities, DeployOptions, DeployShape, LogOptions, ProviderError};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> axum::response::Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

/// Map a provider error onto an HTTP status.
fn provider_error_response(err: &ProviderError) -> axum::response::Response {
    let status = match err {
        ProviderError::NotRegistered { .. } => StatusCode::NOT_FOUND,
        ProviderError::ServiceNotFound(_) | ProviderError::DeploymentNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        ProviderError::UnsupportedOperation { .. } => StatusCode::CONFLICT,
        ProviderError::Deploy { .. } => StatusCode::BAD_GATEWAY,
        ProviderError::Backend(_) => StatusCode::BAD_GATEWAY,
    };
    error_response(&err.to_string(), status)
}

// ── Health ─────────────────────────────────────────────────────

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    ApiResponse::ok("ok")
}

// ── Providers ──────────────────────────────────────────────────

#[derive(serde::Serialize)]
pub struct ProviderInfo {
    name: &'static str,
    available: bool,
    capabilities: Capabilities,
}

/// GET /api/v1/providers
pub async fn list_providers(State(state): State<ApiState>) -> impl IntoResponse {
    let providers: Vec<ProviderInfo> = state
        .registry
        .all()
        .into_iter()
        .map(|p| ProviderInfo {
            name: p.name(),
            available: p.is_available(),
            capabilities: p.capabilities(),
        })
        .collect();
    ApiResponse::ok(providers)
}

// ── Deploy ─────────────────────────────────────────────────────

#[derive(serde::Deserialize)]
pub struct DeployRequest {
    pub provider: String,
    #[serde(default)]
    pub manifest: Option<String>,
    #[serde(default)]
    pub deposit: Option<u64>,
    #[serde(default)]
    pub shape: Option<DeployShape>,
}

/// POST /api/v1/services/{id}/deploy
pub async fn deploy_service(
    State(state): State<ApiState>,
    Path(service_id): Path<String>,
    Json(req): Json<DeployRequest>,
) -> impl IntoResponse {
    let provider = match state.registry.get(&req.provider) {
        Ok(provider) => provider,
        Err(e) => return provider_error_response(&e),
    };
    if !provider.is_available() {
        return error_response(
            &format!("provider {} is not configured", req.provider),
            StatusCode::CONFLICT,
        );
    }

    let options = DeployOptions {
        manifest: req.manifest,
        deposit: req.deposit,
        shape: req.shape.unwrap_or_default(),
    };

    match provider.deploy(&service_id, options).await {
        Ok(result) => {
            info!(service_id, provider = %req.provider, deployment_id = %result.deployment_id, "deploy succeeded");
            invalidate_route(&state, &service_id);
            ApiResponse::ok(result).into_response()
        }
        Err(e) => {
            warn!(service_id, provider = %req.provider, error = %e, "deploy failed");
            invalidate_route(&state, &service_id);
            provider_error_response(&e)
        }
    }
}

/// Drop the cached route for a service's slug after a state change.
fn invalidate_route(state: &ApiState, service_id: &str) {
    let Some(proxy) = &state.proxy else { return };
    match state.store.get_service(service_id) {
        Ok(Some(service)) => proxy.invalidate_slug(&service.slug, None),
        Ok(None) => {}
        Err(e) => warn!(service_id, error = %e, "route invalidation lookup failed"),
    }
}

// ── Deployment lifecycle ───────────────────────────────────────

/// GET /api/v1/deployments/{provider}/{id}/status
pub async fn deployment_status(
    State(state): State<ApiState>,
    Path((provider_name, deployment_id)): Path<(String, String)>,
) -> impl IntoResponse {
    let provider = match state.registry.get(&provider_name) {
        Ok(provider) => provider,
        Err(e) => return provider_error_response(&e),
    };
    match provider.status(&deployment_id).await {
        Ok(report) => ApiResponse::ok(report).into_response(),
        Err(e) => provider_error_response(&e),
    }
}

#[derive(serde::Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub tail: Option<u32>,
    #[serde(default)]
    pub service: Option<String>,
}

/// GET /api/v1/deployments/{provider}/{id}/logs
pub async fn deployment_logs(
    State(state): State<ApiState>,
    Path((provider_name, deployment_id)): Path<(String, String)>,
    Query(query): Query<LogsQuery>,
) -> impl IntoResponse {
    let provider = match state.registry.get(&provider_name) {
        Ok(provider) => provider,
        Err(e) => return provider_error_response(&e),
    };
    let options = LogOptions {
        tail: query.tail,
        service: query.service,
    };
    match provider.logs(&deployment_id, options).await {
        Ok(logs) => ApiResponse::ok(logs).into_response(),
        Err(e) => provider_error_response(&e),
    }
}

/// POST /api/v1/deployments/{provider}/{id}/stop
pub async fn stop_deployment(
    State(state): State<ApiState>,
    Path((provider_name, deployment_id)): Path<(String, String)>,
) -> impl IntoResponse {
    let provider = match state.registry.get(&provider_name) {
        Ok(provider) => provider,
        Err(e) => return provider_error_response(&e),
    };
    match provider.stop(&deployment_id).await {
        Ok(()) => ApiResponse::ok("stopped").into_response(),
        Err(e) => provider_error_response(&e),
    }
}

/// POST /api/v1/deployments/{provider}/{id}/start
pub async fn start_deployment(
    State(state): State<ApiState>,
    Path((provider_name, deployment_id)): Path<(String, String)>,
) -> impl IntoResponse {
    let provider = match state.registry.get(&provider_name) {
        Ok(provider) => provider,
        Err(e) => return provider_error_response(&e),
    };
    match provider.start(&deployment_id).await {
        Ok(()) => ApiResponse::ok("started").into_response(),
        Err(e) => provider_error_response(&e),
    }
}

/// POST /api/v1/deployments/{provider}/{id}/close
pub async fn close_deployment(
    State(state): State<ApiState>,
    Path((provider_name, deployment_id)): Path<(String, String)>,
) -> impl IntoResponse {
    let provider = match state.registry.get(&provider_name) {
        Ok(provider) => provider,
        Err(e) => return provider_error_response(&e),
    };
    match provider.close(&deployment_id).await {
        Ok(()) => {
            if let Some(proxy) = &state.proxy {
                proxy.flush_cache();
            }
            ApiResponse::ok("closed").into_response()
        }
        Err(e) => provider_error_response(&e),
    }
}

// ── Billing ────────────────────────────────────────────────────

#[derive(serde::Deserialize)]
pub struct TopupRequest {
    pub organization_id: String,
    pub new_balance_cents: u64,
}

/// POST /api/v1/billing/topup
///
/// The webhook the billing system calls after a balance change. An
/// insufficient balance is a normal outcome reported in the body, not an
/// HTTP error.
pub async fn billing_topup(
    State(state): State<ApiState>,
    Json(req): Json<TopupRequest>,
) -> impl IntoResponse {
    match state
        .ledger
        .resume_if_funded(&req.organization_id, req.new_balance_cents)
        .await
    {
        Ok(outcome) => {
            if let Some(proxy) = &state.proxy {
                proxy.flush_cache();
            }
            ApiResponse::ok(outcome).into_response()
        }
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}

#[derive(serde::Deserialize)]
pub struct PauseRequest {
    pub organization_id: String,
}

/// POST /api/v1/billing/pause
pub async fn billing_pause(
    State(state): State<ApiState>,
    Json(req): Json<PauseRequest>,
) -> impl IntoResponse {
    match state.ledger.pause_for_organization(&req.organization_id).await {
        Ok(paused) => {
            if let Some(proxy) = &state.proxy {
                proxy.flush_cache();
            }
            ApiResponse::ok(paused).into_response()
        }
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build_router;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use flotilla_escrow::{EscrowConfig, EscrowLedger};
    use flotilla_provider::{
        BillingModel, ConfigFormat, DeploymentProvider, DeploymentResult, ProviderRegistry,
        ProviderResult, StatusReport,
    };
    use flotilla_state::StateStore;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::util::ServiceExt;

    struct EchoProvider;

    #[async_trait]
    impl DeploymentProvider for EchoProvider {
        fn name(&self) -> &'static str {
            "market"
        }
        fn is_available(&self) -> bool {
            true
        }
        async fn deploy(
            &self,
            service_id: &str,
            _options: DeployOptions,
        ) -> ProviderResult<DeploymentResult> {
            if service_id == "missing" {
                return Err(ProviderError::ServiceNotFound(service_id.to_string()));
            }
            Ok(DeploymentResult {
                deployment_id: format!("mkt-{service_id}"),
                service_urls: Default::default(),
                invoke_url: None,
            })
        }
        async fn stop(&self, _deployment_id: &str) -> ProviderResult<()> {
            Err(ProviderError::UnsupportedOperation {
                provider: "market",
                operation: "stop",
            })
        }
        async fn start(&self, _deployment_id: &str) -> ProviderResult<()> {
            Err(ProviderError::UnsupportedOperation {
                provider: "market",
                operation: "start",
            })
        }
        async fn close(&self, _deployment_id: &str) -> ProviderResult<()> {
            Ok(())
        }
        async fn status(&self, deployment_id: &str) -> ProviderResult<StatusReport> {
            Err(ProviderError::DeploymentNotFound(deployment_id.to_string()))
        }
        async fn logs(&self, _deployment_id: &str, _options: LogOptions) -> ProviderResult<String> {
            Ok("log".to_string())
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities {
                supports_stop: false,
                supports_start: false,
                supports_tee: false,
                billing: BillingModel::PerBlockEscrow,
                config_format: ConfigFormat::Sdl,
            }
        }
    }

    fn test_router() -> axum::Router {
        let store = StateStore::open_in_memory().unwrap();
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(EchoProvider));
        let registry = Arc::new(registry);
        let ledger = Arc::new(EscrowLedger::new(
            store.clone(),
            registry.clone(),
            EscrowConfig::default(),
        ));
        build_router(ApiState {
            store,
            registry,
            ledger,
            proxy: None,
        })
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn healthz_responds_ok() {
        let response = test_router()
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn providers_listing_includes_capabilities() {
        let response = test_router()
            .oneshot(Request::get("/api/v1/providers").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["data"][0]["name"], "market");
        assert_eq!(json["data"][0]["capabilities"]["supports_stop"], false);
    }

    #[tokio::test]
    async fn deploy_routes_to_the_named_provider() {
        let request = Request::post("/api/v1/services/svc-1/deploy")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"provider": "market"}"#))
            .unwrap();
        let response = test_router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["data"]["deployment_id"], "mkt-svc-1");
    }

    #[tokio::test]
    async fn deploy_with_unknown_provider_is_404() {
        let request = Request::post("/api/v1/services/svc-1/deploy")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"provider": "ghost"}"#))
            .unwrap();
        let response = test_router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let json = body_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("market"));
    }

    #[tokio::test]
    async fn unsupported_stop_is_409() {
        let request = Request::post("/api/v1/deployments/market/mkt-1/stop")
            .body(Body::empty())
            .unwrap();
        let response = test_router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn topup_with_nothing_paused_reports_so() {
        let request = Request::post("/api/v1/billing/topup")
            .header("content-type", "application/json")
            .body(Body::from(
                r#"{"organization_id": "org-1", "new_balance_cents": 500}"#,
            ))
            .unwrap();
        let response = test_router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["data"]["reason"], "nothing_paused");
    }
}
