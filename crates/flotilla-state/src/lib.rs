//! flotilla-state — embedded state store for Flotilla.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state management for services, marketplace deployments, TEE deployments,
//! and escrows.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Rows are keyed by their id; cross-entity queries (active deployment for a
//! service, escrows for an organization) are table scans, which is fine at
//! control-plane cardinalities.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
