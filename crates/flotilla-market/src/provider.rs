//! `DeploymentProvider` adapter for the marketplace backend.
//!
//! Translates the orchestrator's native status vocabulary and result shape
//! onto the shared provider contract. Unknown native statuses map to
//! `Failed` rather than propagate unmapped.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use flotilla_provider::{
    BillingModel, Capabilities, ConfigFormat, DeployOptions, DeploymentProvider, DeploymentResult,
    LogOptions, ProviderError, ProviderResult, ProviderStatus, StatusReport,
};

use crate::orchestrator::MarketOrchestrator;

/// Registry name for the marketplace backend.
pub const PROVIDER_NAME: &str = "market";

/// Marketplace backend exposed through the shared provider contract.
pub struct MarketProvider {
    orchestrator: Arc<MarketOrchestrator>,
    available: bool,
}

impl MarketProvider {
    /// `available` reflects chain credential presence, checked at startup.
    pub fn new(orchestrator: Arc<MarketOrchestrator>, available: bool) -> Self {
        Self {
            orchestrator,
            available,
        }
    }

    pub fn orchestrator(&self) -> &Arc<MarketOrchestrator> {
        &self.orchestrator
    }
}

/// Map the backend's native status strings onto the canonical vocabulary.
pub fn map_native_status(native: &str) -> ProviderStatus {
    match native {
        "creating" | "waiting_bids" | "selecting_bid" | "creating_lease" => {
            ProviderStatus::Creating
        }
        "sending_manifest" | "deploying" => ProviderStatus::Deploying,
        "active" => ProviderStatus::Active,
        "suspended" => ProviderStatus::Suspended,
        "closed" => ProviderStatus::Closed,
        // "failed" and anything this adapter does not recognize.
        _ => ProviderStatus::Failed,
    }
}

#[async_trait]
impl DeploymentProvider for MarketProvider {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn is_available(&self) -> bool {
        self.available
    }

    async fn deploy(
        &self,
        service_id: &str,
        options: DeployOptions,
    ) -> ProviderResult<DeploymentResult> {
        Ok(self.orchestrator.deploy(service_id, options).await?)
    }

    async fn stop(&self, _deployment_id: &str) -> ProviderResult<()> {
        // Leases cannot be paused; closing is the only way down.
        Err(ProviderError::UnsupportedOperation {
            provider: PROVIDER_NAME,
            operation: "stop",
        })
    }

    async fn start(&self, _deployment_id: &str) -> ProviderResult<()> {
        Err(ProviderError::UnsupportedOperation {
            provider: PROVIDER_NAME,
            operation: "start",
        })
    }

    async fn close(&self, deployment_id: &str) -> ProviderResult<()> {
        Ok(self.orchestrator.close(deployment_id).await?)
    }

    async fn status(&self, deployment_id: &str) -> ProviderResult<StatusReport> {
        let dep = self.orchestrator.get(deployment_id)?;
        let native = dep.status.as_native();

        let mut metadata = BTreeMap::new();
        metadata.insert("dseq".to_string(), dep.dseq.to_string());
        metadata.insert("owner".to_string(), dep.owner.clone());
        if let Some(provider) = &dep.provider {
            metadata.insert("provider".to_string(), provider.clone());
            metadata.insert("gseq".to_string(), dep.gseq.to_string());
            metadata.insert("oseq".to_string(), dep.oseq.to_string());
        }
        if let Some(error) = &dep.error_message {
            metadata.insert("error".to_string(), error.clone());
        }

        Ok(StatusReport {
            status: map_native_status(native),
            native_status: native.to_string(),
            service_urls: dep.service_urls,
            metadata,
        })
    }

    async fn logs(&self, deployment_id: &str, options: LogOptions) -> ProviderResult<String> {
        Ok(self
            .orchestrator
            .logs(deployment_id, options.tail, options.service.as_deref())
            .await?)
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
