//! flotilla-tee — the confidential-computing backend driver.
//!
//! A much simpler lifecycle than the marketplace: the remote control API
//! creates an attested app from a compose manifest, and `start`/`stop` are
//! reversible. No bidding, no leases, no escrow — billing is hourly and
//! metered remotely.
//!
//! The control API is an opaque collaborator behind the [`TeeControlApi`]
//! trait; attestation is the remote side's business.

pub mod client;
pub mod error;
pub mod orchestrator;
pub mod provider;

pub use client::{AppState, HttpTeeClient, TeeClientConfig, TeeControlApi};
pub use error::{TeeError, TeeResult};
pub use orchestrator::{TeeConfig, TeeOrchestrator};
pub use provider::TeeProvider;
