//! flotilla-market — the marketplace deployment orchestrator.
//!
//! Drives the full create → bid → lease → manifest → poll state machine
//! against a bidding/leasing compute marketplace:
//!
//! - Submits the deployment-create transaction and parses the assigned
//!   sequence number
//! - Polls for competitive bids with increasing linear backoff
//! - Filters unsafe providers and selects the cheapest remaining bid
//! - Creates the lease, delivers the workload manifest, and polls the
//!   provider until the workload is externally reachable
//! - Hands slow-ingress deployments to a bounded background backfill task
//!
//! The chain is an opaque external collaborator: `ChainClient` wraps a CLI
//! binary whose JSON output is parsed fail-fast, and `ProviderGateway` wraps
//! the winning provider's HTTP endpoint. Both are traits so the state
//! machine is testable without a chain.

pub mod backfill;
pub mod bids;
pub mod chain;
pub mod error;
pub mod gateway;
pub mod orchestrator;
pub mod provider;

pub use backfill::BackfillSupervisor;
pub use bids::{Bid, DenyPolicy, ScoredBid, Selection, select};
pub use chain::{ChainClient, ChainConfig, CliChainClient};
pub use error::{ChainError, GatewayError, MarketError, MarketResult};
pub use gateway::{HttpProviderGateway, LeaseRef, ProviderGateway};
pub use orchestrator::{
    EscrowHook, EscrowRequest, ManifestCompiler, MarketConfig, MarketOrchestrator,
    SourceConfigCompiler,
};
pub use provider::MarketProvider;
