//! flotilla-provider — the uniform deployment interface.
//!
//! Every compute backend implements [`DeploymentProvider`]: a single
//! contract hiding two very different protocols (an on-chain bidding
//! marketplace and a confidential-computing control API). The rest of the
//! system — the REST surface, the escrow ledger, the billing webhook —
//! drives deployments exclusively through this trait and never touches an
//! orchestrator directly.
//!
//! The [`ProviderRegistry`] maps provider names to implementations. It is
//! built once at process start and shared read-only after that.

pub mod error;
pub mod provider;
pub mod registry;
pub mod status;

pub use error::{ProviderError, ProviderResult};
pub use provider::{
    BillingModel, Capabilities, ConfigFormat, DeployOptions, DeployShape, DeploymentProvider,
    DeploymentResult, LogOptions,
};
pub use registry::ProviderRegistry;
pub use status::{ProviderStatus, StatusReport};
