//! Escrow ledger error types.

use thiserror::Error;

use flotilla_provider::ProviderError;
use flotilla_state::StateError;

/// Result type alias for escrow operations.
pub type EscrowResult<T> = Result<T, EscrowError>;

/// Errors that can occur in the escrow ledger.
#[derive(Debug, Error)]
pub enum EscrowError {
    #[error("escrow not found: {0}")]
    NotFound(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
}
