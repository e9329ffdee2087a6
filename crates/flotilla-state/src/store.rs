//! StateStore — redb-backed state persistence for Flotilla.
//!
//! Provides typed CRUD operations over services, marketplace deployments,
//! TEE deployments, and escrows. All values are JSON-serialized into redb's
//! `&[u8]` value columns. The store supports both on-disk and in-memory
//! backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(SERVICES).map_err(map_err!(Table))?;
        txn.open_table(MARKET_DEPLOYMENTS).map_err(map_err!(Table))?;
        txn.open_table(TEE_DEPLOYMENTS).map_err(map_err!(Table))?;
        txn.open_table(ESCROWS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Generic insert-or-update of a JSON-serialized row.
    fn put<T: serde::Serialize>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
        value: &T,
    ) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Generic point lookup of a JSON-serialized row.
    fn get<T: serde::de::DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Generic full scan of a table.
    fn scan<T: serde::de::DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let row = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(row);
        }
        Ok(results)
    }

    // ── Services ───────────────────────────────────────────────────

    /// Insert or update a service.
    pub fn put_service(&self, service: &Service) -> StateResult<()> {
        self.put(SERVICES, &service.id, service)?;
        debug!(service_id = %service.id, slug = %service.slug, "service stored");
        Ok(())
    }

    /// Get a service by id.
    pub fn get_service(&self, id: &str) -> StateResult<Option<Service>> {
        self.get(SERVICES, id)
    }

    /// Get a service by id, erroring when absent.
    pub fn require_service(&self, id: &str) -> StateResult<Service> {
        self.get_service(id)?
            .ok_or_else(|| StateError::NotFound(format!("service {id}")))
    }

    /// Find a service by its globally unique slug.
    pub fn get_service_by_slug(&self, slug: &str) -> StateResult<Option<Service>> {
        let services: Vec<Service> = self.scan(SERVICES)?;
        Ok(services.into_iter().find(|s| s.slug == slug))
    }

    /// List all services.
    pub fn list_services(&self) -> StateResult<Vec<Service>> {
        self.scan(SERVICES)
    }

    // ── Marketplace deployments ────────────────────────────────────

    /// Insert or update a marketplace deployment.
    pub fn put_market_deployment(&self, dep: &MarketDeployment) -> StateResult<()> {
        self.put(MARKET_DEPLOYMENTS, &dep.id, dep)?;
        debug!(deployment_id = %dep.id, status = ?dep.status, "market deployment stored");
        Ok(())
    }

    /// Get a marketplace deployment by id.
    pub fn get_market_deployment(&self, id: &str) -> StateResult<Option<MarketDeployment>> {
        self.get(MARKET_DEPLOYMENTS, id)
    }

    /// List all marketplace deployments.
    pub fn list_market_deployments(&self) -> StateResult<Vec<MarketDeployment>> {
        self.scan(MARKET_DEPLOYMENTS)
    }

    /// All marketplace deployments for a service.
    pub fn market_deployments_for_service(
        &self,
        service_id: &str,
    ) -> StateResult<Vec<MarketDeployment>> {
        let all: Vec<MarketDeployment> = self.scan(MARKET_DEPLOYMENTS)?;
        Ok(all.into_iter().filter(|d| d.service_id == service_id).collect())
    }

    /// The most recent deployment for a service in `Active` or `Suspended`
    /// status, if any.
    pub fn active_market_deployment(
        &self,
        service_id: &str,
    ) -> StateResult<Option<MarketDeployment>> {
        let mut candidates: Vec<MarketDeployment> = self
            .market_deployments_for_service(service_id)?
            .into_iter()
            .filter(|d| {
                matches!(
                    d.status,
                    MarketDeploymentStatus::Active | MarketDeploymentStatus::Suspended
                )
            })
            .collect();
        candidates.sort_by_key(|d| d.created_at);
        Ok(candidates.pop())
    }

    /// Active marketplace deployments that never surfaced a service URI.
    ///
    /// Used by the startup-recovery scan to re-launch interrupted backfills.
    pub fn active_deployments_missing_urls(&self) -> StateResult<Vec<MarketDeployment>> {
        let all: Vec<MarketDeployment> = self.scan(MARKET_DEPLOYMENTS)?;
        Ok(all
            .into_iter()
            .filter(|d| d.status == MarketDeploymentStatus::Active && !d.has_urls())
            .collect())
    }

    // ── TEE deployments ────────────────────────────────────────────

    /// Insert or update a TEE deployment.
    pub fn put_tee_deployment(&self, dep: &TeeDeployment) -> StateResult<()> {
        self.put(TEE_DEPLOYMENTS, &dep.id, dep)?;
        debug!(deployment_id = %dep.id, status = ?dep.status, "tee deployment stored");
        Ok(())
    }

    /// Get a TEE deployment by id.
    pub fn get_tee_deployment(&self, id: &str) -> StateResult<Option<TeeDeployment>> {
        self.get(TEE_DEPLOYMENTS, id)
    }

    /// All TEE deployments for a service.
    pub fn tee_deployments_for_service(&self, service_id: &str) -> StateResult<Vec<TeeDeployment>> {
        let all: Vec<TeeDeployment> = self.scan(TEE_DEPLOYMENTS)?;
        Ok(all.into_iter().filter(|d| d.service_id == service_id).collect())
    }

    /// The most recent `Active` or `Stopped` TEE deployment for a service.
    pub fn active_tee_deployment(&self, service_id: &str) -> StateResult<Option<TeeDeployment>> {
        let mut candidates: Vec<TeeDeployment> = self
            .tee_deployments_for_service(service_id)?
            .into_iter()
            .filter(|d| {
                matches!(
                    d.status,
                    TeeDeploymentStatus::Active | TeeDeploymentStatus::Stopped
                )
            })
            .collect();
        candidates.sort_by_key(|d| d.created_at);
        Ok(candidates.pop())
    }

    // ── Escrows ────────────────────────────────────────────────────

    /// Insert or update an escrow.
    pub fn put_escrow(&self, escrow: &Escrow) -> StateResult<()> {
        self.put(ESCROWS, &escrow.id, escrow)?;
        debug!(escrow_id = %escrow.id, status = ?escrow.status, "escrow stored");
        Ok(())
    }

    /// Get an escrow by id.
    pub fn get_escrow(&self, id: &str) -> StateResult<Option<Escrow>> {
        self.get(ESCROWS, id)
    }

    /// All escrows currently in `Active` status.
    pub fn active_escrows(&self) -> StateResult<Vec<Escrow>> {
        let all: Vec<Escrow> = self.scan(ESCROWS)?;
        Ok(all
            .into_iter()
            .filter(|e| e.status == EscrowStatus::Active)
            .collect())
    }

    /// All escrows for an organization, any status.
    pub fn escrows_for_organization(&self, organization_id: &str) -> StateResult<Vec<Escrow>> {
        let all: Vec<Escrow> = self.scan(ESCROWS)?;
        Ok(all
            .into_iter()
            .filter(|e| e.organization_id == organization_id)
            .collect())
    }

    /// The escrow linked to a marketplace deployment, if any.
    pub fn escrow_for_deployment(&self, market_deployment_id: &str) -> StateResult<Option<Escrow>> {
        let all: Vec<Escrow> = self.scan(ESCROWS)?;
        Ok(all
            .into_iter()
            .find(|e| e.market_deployment_id == market_deployment_id))
    }
}
