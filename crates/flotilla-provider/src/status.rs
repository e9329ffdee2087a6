//! Canonical deployment status vocabulary.
//!
//! Backends speak their own dialects; adapters translate every native
//! status onto this set and keep the native string for diagnostics.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Canonical status of a deployment across all backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    /// Deployment is being created (any pre-manifest phase).
    Creating,
    /// Workload is being brought up on the backend.
    Deploying,
    /// Workload is running and (possibly) reachable.
    Active,
    /// Paused by the billing lifecycle.
    Suspended,
    /// Stopped via backend pause semantics (reversible).
    Stopped,
    /// Terminal failure.
    Failed,
    /// Closed for good.
    Closed,
}

impl ProviderStatus {
    /// Whether the workload still occupies backend resources.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Creating | Self::Deploying | Self::Active | Self::Suspended)
    }
}

/// Status report returned by `DeploymentProvider::status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: ProviderStatus,
    /// The backend's own status vocabulary, preserved verbatim.
    pub native_status: String,
    /// Logical service name → reachable URIs.
    pub service_urls: BTreeMap<String, Vec<String>>,
    /// Backend-specific extras (lease coordinates, app id, …).
    pub metadata: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_statuses() {
        assert!(ProviderStatus::Active.is_live());
        assert!(ProviderStatus::Suspended.is_live());
        assert!(!ProviderStatus::Closed.is_live());
        assert!(!ProviderStatus::Failed.is_live());
        assert!(!ProviderStatus::Stopped.is_live());
    }

    #[test]
    fn serializes_snake_case() {
        let json = serde_json::to_string(&ProviderStatus::Suspended).unwrap();
        assert_eq!(json, "\"suspended\"");
    }
}
