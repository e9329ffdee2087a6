//! flotilla-escrow — prepaid balances tied to deployment state.
//!
//! Every marketplace deployment carries an escrow: a prepaid balance that
//! depletes at a daily rate derived from the winning bid price plus an
//! organizational margin. The ledger owns the pause/resume lifecycle:
//!
//! - A depleted escrow pauses its deployment through the provider contract
//! - A balance top-up resumes an organization's paused deployments, but
//!   only when the new balance covers at least one full day of their
//!   combined burn — all or nothing, so a marginal top-up cannot thrash a
//!   deployment on and off
//!
//! On the marketplace backend "resume" means a full redeploy from the saved
//! manifest (closing a lease is permanent); the TEE backend restarts the
//! same instance in place.

pub mod error;
pub mod ledger;

pub use error::{EscrowError, EscrowResult};
pub use ledger::{CreateEscrow, EscrowConfig, EscrowLedger, ResumeOutcome};
