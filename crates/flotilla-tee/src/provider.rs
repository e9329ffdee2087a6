//! `DeploymentProvider` adapter for the TEE backend.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use flotilla_provider::{
    BillingModel, Capabilities, ConfigFormat, DeployOptions, DeploymentProvider, DeploymentResult,
    LogOptions, ProviderResult, ProviderStatus, StatusReport,
};

use crate::orchestrator::TeeOrchestrator;

/// Registry name for the TEE backend.
pub const PROVIDER_NAME: &str = "tee";

/// TEE backend exposed through the shared provider contract.
pub struct TeeProvider {
    orchestrator: Arc<TeeOrchestrator>,
    available: bool,
}

impl TeeProvider {
    pub fn new(orchestrator: Arc<TeeOrchestrator>, available: bool) -> Self {
        Self {
            orchestrator,
            available,
        }
    }

    pub fn orchestrator(&self) -> &Arc<TeeOrchestrator> {
        &self.orchestrator
    }
}

/// Map the control API's native vocabulary onto the canonical set.
pub fn map_native_status(native: &str) -> ProviderStatus {
    match native {
        "provisioning" | "pending" => ProviderStatus::Creating,
        "starting" | "booting" => ProviderStatus::Deploying,
        "running" | "degraded" => ProviderStatus::Active,
        "stopping" | "stopped" => ProviderStatus::Stopped,
        "terminated" | "deleted" => ProviderStatus::Closed,
        // "error", "crashed", and anything unrecognized.
        _ => ProviderStatus::Failed,
    }
}

#[async_trait]
impl DeploymentProvider for TeeProvider {
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

    async fn stop(&self, deployment_id: &str) -> ProviderResult<()> {
        Ok(self.orchestrator.stop(deployment_id).await?)
    }

    async fn start(&self, deployment_id: &str) -> ProviderResult<()> {
        Ok(self.orchestrator.start(deployment_id).await?)
    }

    async fn close(&self, deployment_id: &str) -> ProviderResult<()> {
        Ok(self.orchestrator.close(deployment_id).await?)
    }

    async fn status(&self, deployment_id: &str) -> ProviderResult<StatusReport> {
        let (dep, native) = self.orchestrator.remote_status(deployment_id).await?;

        let mut service_urls = BTreeMap::new();
        if let Some(url) = &dep.app_url {
            service_urls.insert("app".to_string(), vec![url.clone()]);
        }

        let mut metadata = BTreeMap::new();
        metadata.insert("app_id".to_string(), dep.app_id.clone());
        metadata.insert(
            "hourly_rate_cents".to_string(),
            dep.hourly_rate_cents.to_string(),
        );

        Ok(StatusReport {
            status: map_native_status(&native),
            native_status: native,
            service_urls,
            metadata,
        })
    }

    async fn logs(&self, deployment_id: &str, options: LogOptions) -> ProviderResult<String> {
        Ok(self.orchestrator.logs(deployment_id, options.tail).await?)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_stop: true,
            supports_start: true,
            supports_tee: true,
            billing: BillingModel::HourlyMetered,
            config_format: ConfigFormat::Compose,
        }
    }
}
