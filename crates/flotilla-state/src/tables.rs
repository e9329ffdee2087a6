//! redb table definitions for the Flotilla state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). All tables are keyed by the entity's own id.

use redb::TableDefinition;

/// Services keyed by `{service_id}`.
pub const SERVICES: TableDefinition<&str, &[u8]> = TableDefinition::new("services");

/// Marketplace deployments keyed by `{deployment_id}`.
pub const MARKET_DEPLOYMENTS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("market_deployments");

/// TEE deployments keyed by `{deployment_id}`.
pub const TEE_DEPLOYMENTS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("tee_deployments");

/// Escrows keyed by `{escrow_id}`.
pub const ESCROWS: TableDefinition<&str, &[u8]> = TableDefinition::new("escrows");
