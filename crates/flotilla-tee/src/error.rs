//! TEE orchestrator error types.

use thiserror::Error;

use flotilla_provider::ProviderError;
use flotilla_state::StateError;

/// Result type alias for TEE operations.
pub type TeeResult<T> = Result<T, TeeError>;

/// Errors surfaced by the TEE orchestrator.
#[derive(Debug, Error)]
pub enum TeeError {
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("deployment not found: {0}")]
    DeploymentNotFound(String),

    #[error("control api request failed: {0}")]
    Request(String),

    #[error("control api returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("unexpected control api response shape: {0}")]
    Parse(String),

    #[error("app did not become ready within {attempts} polls")]
    NeverReady { attempts: u32 },

    #[error("deploy cancelled")]
    Cancelled,

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl TeeError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ServiceNotFound(_) => "service_not_found",
            Self::DeploymentNotFound(_) => "deployment_not_found",
            Self::Request(_) => "control_api_unreachable",
            Self::Api { .. } => "control_api_error",
            Self::Parse(_) => "control_api_bad_response",
            Self::NeverReady { .. } => "app_never_ready",
            Self::Cancelled => "cancelled",
            Self::State(_) => "state_error",
        }
    }
}

impl From<TeeError> for ProviderError {
    fn from(err: TeeError) -> Self {
        match err {
            TeeError::ServiceNotFound(id) => ProviderError::ServiceNotFound(id),
            TeeError::DeploymentNotFound(id) => ProviderError::DeploymentNotFound(id),
            other => ProviderError::Deploy {
                code: other.code().to_string(),
                message: other.to_string(),
            },
        }
    }
}
