//! The `DeploymentProvider` trait — one contract over both backends.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ProviderResult;
use crate::status::StatusReport;

/// How a deployment will be exposed to the outside world.
///
/// A `Standalone` deployment is only ever reached through the subdomain
/// proxy, so bid filtering may tolerate providers a directly-exposed
/// deployment would refuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployShape {
    #[default]
    Standalone,
    Exposed,
}

/// Options for a deploy call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployOptions {
    /// Pre-compiled manifest text. When absent, the orchestrator generates
    /// one from the service's source configuration.
    pub manifest: Option<String>,
    /// Deposit override for escrow-billed backends.
    pub deposit: Option<u64>,
    #[serde(default)]
    pub shape: DeployShape,
}

/// Options for a log fetch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogOptions {
    /// Number of trailing lines, backend default when absent.
    pub tail: Option<u32>,
    /// Restrict to one logical service.
    pub service: Option<String>,
}

/// Result of a successful deploy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentResult {
    pub deployment_id: String,
    /// Logical service name → reachable URIs. May be empty if ingress is
    /// still settling; a backfill task keeps watching in that case.
    pub service_urls: BTreeMap<String, Vec<String>>,
    /// Public URL chosen for the owning service, if one was observed.
    pub invoke_url: Option<String>,
}

/// How a backend charges for compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingModel {
    /// Prepaid on-chain escrow drained per block.
    PerBlockEscrow,
    /// Metered hourly billing.
    HourlyMetered,
}

/// Manifest dialect a backend consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigFormat {
    Sdl,
    Compose,
}

/// What a backend can and cannot do.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Capabilities {
    pub supports_stop: bool,
    pub supports_start: bool,
    pub supports_tee: bool,
    pub billing: BillingModel,
    pub config_format: ConfigFormat,
}

/// Uniform interface over heterogeneous deployment backends.
///
/// Implementations translate their native protocol (on-chain bidding,
/// remote TEE control API) into this contract. Status reports always carry
/// a canonical status; native vocabulary is preserved alongside it.
#[async_trait]
pub trait DeploymentProvider: Send + Sync {
    /// Stable provider name used as the registry key.
    fn name(&self) -> &'static str;

    /// Whether required credentials/configuration are present.
    ///
    /// A pure check, no I/O. Unavailable providers are registered but
    /// filtered out of `ProviderRegistry::available`.
    fn is_available(&self) -> bool;

    /// Run the backend's full deployment flow for a service.
    async fn deploy(&self, service_id: &str, options: DeployOptions)
        -> ProviderResult<DeploymentResult>;

    /// Pause a running deployment.
    ///
    /// Fails with `UnsupportedOperation` on backends without pause
    /// semantics (the marketplace backend cannot stop a lease).
    async fn stop(&self, deployment_id: &str) -> ProviderResult<()>;

    /// Resume a stopped deployment. `UnsupportedOperation` by default.
    async fn start(&self, deployment_id: &str) -> ProviderResult<()>;

    /// Tear a deployment down for good.
    ///
    /// Idempotent: closing an already-closed deployment is a no-op.
    async fn close(&self, deployment_id: &str) -> ProviderResult<()>;

    /// Current status of a deployment.
    async fn status(&self, deployment_id: &str) -> ProviderResult<StatusReport>;

    /// Fetch workload logs.
    async fn logs(&self, deployment_id: &str, options: LogOptions) -> ProviderResult<String>;

    /// Static description of what this backend supports.
    fn capabilities(&self) -> Capabilities;
}
