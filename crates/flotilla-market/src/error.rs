//! Marketplace orchestrator error types.

use thiserror::Error;

use flotilla_provider::ProviderError;
use flotilla_state::StateError;

/// Result type alias for marketplace operations.
pub type MarketResult<T> = Result<T, MarketError>;

/// Errors from the chain CLI boundary.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("failed to spawn chain cli: {0}")]
    Spawn(String),

    #[error("chain cli exited with status {status}: {stderr}")]
    Cli { status: i32, stderr: String },

    #[error("chain call timed out after {secs}s: {what}")]
    Timeout { what: &'static str, secs: u64 },

    #[error("unexpected chain response shape: {0}")]
    Parse(String),
}

/// Errors from the provider gateway (manifest/status HTTP endpoint).
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("provider request failed: {0}")]
    Request(String),

    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected provider response shape: {0}")]
    Parse(String),
}

/// Errors surfaced by the marketplace orchestrator.
#[derive(Debug, Error)]
pub enum MarketError {
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("deployment not found: {0}")]
    DeploymentNotFound(String),

    #[error("deployment creation failed: {0}")]
    DeploymentCreationFailed(String),

    #[error("no bids received after {attempts} attempts")]
    NoBidsReceived { attempts: u32 },

    #[error("no safe bids available ({rejected} bids rejected by provider policy)")]
    NoSafeBidsAvailable { rejected: usize },

    #[error("lease creation failed: {0}")]
    LeaseCreationFailed(String),

    #[error("manifest send failed after retry: {0}")]
    ManifestSendFailed(String),

    #[error("manifest generation failed: {0}")]
    Manifest(String),

    #[error("deploy cancelled")]
    Cancelled,

    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("provider gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl MarketError {
    /// Stable machine-readable code for the provider contract boundary.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ServiceNotFound(_) => "service_not_found",
            Self::DeploymentNotFound(_) => "deployment_not_found",
            Self::DeploymentCreationFailed(_) => "deployment_creation_failed",
            Self::NoBidsReceived { .. } => "no_bids_received",
            Self::NoSafeBidsAvailable { .. } => "no_safe_bids_available",
            Self::LeaseCreationFailed(_) => "lease_creation_failed",
            Self::ManifestSendFailed(_) => "manifest_send_failed",
            Self::Manifest(_) => "manifest_generation_failed",
            Self::Cancelled => "cancelled",
            Self::Chain(_) => "chain_error",
            Self::Gateway(_) => "provider_gateway_error",
            Self::State(_) => "state_error",
        }
    }
}

impl From<MarketError> for ProviderError {
    fn from(err: MarketError) -> Self {
        match err {
            MarketError::ServiceNotFound(id) => ProviderError::ServiceNotFound(id),
            MarketError::DeploymentNotFound(id) => ProviderError::DeploymentNotFound(id),
            other => ProviderError::Deploy {
                code: other.code().to_string(),
                message: other.to_string(),
            },
        }
    }
}
