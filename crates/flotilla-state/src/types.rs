//! Domain types for the Flotilla state store.
//!
//! These types represent the persisted state of services, marketplace
//! deployments, TEE deployments, and escrows. All types are serializable
//! to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Unique identifier for a service.
pub type ServiceId = String;

/// Unique identifier for a deployment (either backend kind).
pub type DeploymentId = String;

/// Unique identifier for an escrow.
pub type EscrowId = String;

// ── Service ───────────────────────────────────────────────────────

/// An abstract deployable unit, owned by the external CRUD layer.
///
/// The core reads services and updates only `status` and `invoke_url`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Service {
    pub id: ServiceId,
    pub service_type: ServiceType,
    /// Routing key, globally unique across all services.
    pub slug: String,
    pub project_id: String,
    pub organization_id: String,
    pub status: ServiceStatus,
    /// Public invocation URL, set once a deployment exposes one.
    pub invoke_url: Option<String>,
    /// Source configuration handed to the manifest compiler.
    pub source_config: String,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Kind of deployable unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    Function,
    Site,
    Vm,
    Database,
}

/// Lifecycle status of a service as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Pending,
    Deploying,
    Active,
    Failed,
    Closed,
}

// ── Marketplace deployment ────────────────────────────────────────

/// One attempt to run a service on the bidding/leasing backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketDeployment {
    pub id: DeploymentId,
    pub service_id: ServiceId,
    /// Wallet/account id that owns the on-chain deployment.
    pub owner: String,
    /// Positive sequence number assigned by the chain.
    pub dseq: u64,
    /// Manifest text submitted on-chain and delivered to the provider.
    pub sdl_content: String,
    /// Selected counterparty, None until a lease exists.
    pub provider: Option<String>,
    pub gseq: u32,
    pub oseq: u32,
    /// Winning bid price, None until a bid is selected.
    pub price_per_unit: Option<f64>,
    pub deposit_amount: u64,
    pub status: MarketDeploymentStatus,
    /// Logical port name → reachable URIs, as reported by the provider.
    pub service_urls: BTreeMap<String, Vec<String>>,
    pub error_message: Option<String>,
    pub created_at: u64,
    pub deployed_at: Option<u64>,
    pub closed_at: Option<u64>,
}

/// State machine for a marketplace deployment.
///
/// Linear progression `Creating → … → Active`; `Failed` is reachable from
/// every state, `Closed` from `Active`/`Failed` or any state pre-empted by a
/// redeploy. `Suspended` is the paused variant of `Active` used by the
/// escrow ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketDeploymentStatus {
    Creating,
    WaitingBids,
    SelectingBid,
    CreatingLease,
    SendingManifest,
    Deploying,
    Active,
    Suspended,
    Failed,
    Closed,
}

impl MarketDeploymentStatus {
    /// The backend's own vocabulary, preserved for diagnostics.
    pub fn as_native(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::WaitingBids => "waiting_bids",
            Self::SelectingBid => "selecting_bid",
            Self::CreatingLease => "creating_lease",
            Self::SendingManifest => "sending_manifest",
            Self::Deploying => "deploying",
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Failed => "failed",
            Self::Closed => "closed",
        }
    }
}

impl MarketDeployment {
    /// First reachable URI across all logical services, if any.
    pub fn first_url(&self) -> Option<&str> {
        self.service_urls
            .values()
            .flat_map(|uris| uris.iter())
            .map(String::as_str)
            .next()
    }

    /// Whether any logical service has reported a reachable URI.
    pub fn has_urls(&self) -> bool {
        self.service_urls.values().any(|uris| !uris.is_empty())
    }
}

// ── TEE deployment ────────────────────────────────────────────────

/// One attempt to run a service on the confidential-computing backend.
///
/// Simpler lifecycle than the marketplace: no bidding, and `start`/`stop`
/// are reversible. Deletion is permanent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TeeDeployment {
    pub id: DeploymentId,
    pub service_id: ServiceId,
    /// Identifier assigned by the remote control API.
    pub app_id: String,
    pub status: TeeDeploymentStatus,
    pub app_url: Option<String>,
    pub hourly_rate_cents: u64,
    pub total_billed_cents: u64,
    pub last_billed_at: Option<u64>,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Lifecycle status of a TEE deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeeDeploymentStatus {
    Creating,
    Starting,
    Active,
    Failed,
    Stopped,
    Deleted,
}

impl TeeDeploymentStatus {
    pub fn as_native(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
            Self::Deleted => "deleted",
        }
    }
}

// ── Escrow ────────────────────────────────────────────────────────

/// A prepaid balance earmarked for one marketplace deployment.
///
/// Invariant: `consumed_cents <= deposit_cents` at all times. A consumption
/// update that would violate this clamps instead and the escrow transitions
/// to `Depleted`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Escrow {
    pub id: EscrowId,
    pub market_deployment_id: DeploymentId,
    pub organization_id: String,
    pub deposit_cents: u64,
    pub consumed_cents: u64,
    pub daily_rate_cents: u64,
    pub status: EscrowStatus,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Lifecycle status of an escrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    Active,
    Paused,
    Depleted,
    Refunded,
}

impl Escrow {
    /// Remaining balance.
    pub fn remaining_cents(&self) -> u64 {
        self.deposit_cents.saturating_sub(self.consumed_cents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&MarketDeploymentStatus::WaitingBids).unwrap();
        assert_eq!(json, "\"waiting_bids\"");
        let json = serde_json::to_string(&TeeDeploymentStatus::Stopped).unwrap();
        assert_eq!(json, "\"stopped\"");
    }

    #[test]
    fn first_url_flattens_service_map() {
        let mut urls = BTreeMap::new();
        urls.insert("web".to_string(), vec!["http://a.example".to_string()]);
        urls.insert("api".to_string(), Vec::new());
        let dep = MarketDeployment {
            id: "md-1".into(),
            service_id: "svc-1".into(),
            owner: "owner1".into(),
            dseq: 42,
            sdl_content: String::new(),
            provider: None,
            gseq: 1,
            oseq: 1,
            price_per_unit: None,
            deposit_amount: 0,
            status: MarketDeploymentStatus::Active,
            service_urls: urls,
            error_message: None,
            created_at: 0,
            deployed_at: None,
            closed_at: None,
        };
        // BTreeMap iterates "api" first; its empty list is skipped.
        assert_eq!(dep.first_url(), Some("http://a.example"));
        assert!(dep.has_urls());
    }

    #[test]
    fn escrow_remaining_saturates() {
        let escrow = Escrow {
            id: "e1".into(),
            market_deployment_id: "md-1".into(),
            organization_id: "org-1".into(),
            deposit_cents: 100,
            consumed_cents: 100,
            daily_rate_cents: 10,
            status: EscrowStatus::Depleted,
            created_at: 0,
            updated_at: 0,
        };
        assert_eq!(escrow.remaining_cents(), 0);
    }
}
