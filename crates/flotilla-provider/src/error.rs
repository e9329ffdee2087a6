//! Provider contract error types.

use thiserror::Error;

/// Result type alias for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors surfaced through the shared provider contract.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider not registered: {name} (available: {available})")]
    NotRegistered { name: String, available: String },

    #[error("operation {operation} is not supported by provider {provider}")]
    UnsupportedOperation {
        provider: &'static str,
        operation: &'static str,
    },

    #[error("deployment not found: {0}")]
    DeploymentNotFound(String),

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    /// Terminal deployment failure, carrying the backend's error code so
    /// callers can react to specific failure classes without string matching.
    #[error("deployment failed ({code}): {message}")]
    Deploy { code: String, message: String },

    #[error("backend error: {0}")]
    Backend(String),
}
