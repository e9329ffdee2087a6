//! URI backfill — bounded background polling for slow provider ingress.
//!
//! Some providers take minutes to expose service URIs after the workload
//! starts. Instead of blocking the deploy caller, the orchestrator marks the
//! deployment `Active` and hands it to this supervisor, which keeps polling
//! at a longer interval until URIs appear, the deployment stops being
//! active, or the bounded attempts run out.
//!
//! The supervisor also re-launches watchers for deployments interrupted by
//! a process restart (`Active` rows with an empty URI map).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use flotilla_state::{MarketDeploymentStatus, StateStore};

use crate::chain::ChainClient;
use crate::gateway::{LeaseRef, ProviderGateway};

/// Per-deployment watcher state.
struct Slot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Supervises URI backfill watchers for active deployments.
pub struct BackfillSupervisor {
    store: StateStore,
    chain: Arc<dyn ChainClient>,
    gateway: Arc<dyn ProviderGateway>,
    slots: Arc<RwLock<HashMap<String, Slot>>>,
    interval: Duration,
    max_attempts: u32,
    global_shutdown: watch::Receiver<bool>,
}

impl BackfillSupervisor {
    pub fn new(
        store: StateStore,
        chain: Arc<dyn ChainClient>,
        gateway: Arc<dyn ProviderGateway>,
        global_shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            chain,
            gateway,
            slots: Arc::new(RwLock::new(HashMap::new())),
            interval: Duration::from_secs(10),
            max_attempts: 18, // ~3 minutes at the default interval
            global_shutdown,
        }
    }

    /// Override polling cadence (for testing).
    pub fn with_timing(mut self, interval: Duration, max_attempts: u32) -> Self {
        self.interval = interval;
        self.max_attempts = max_attempts;
        self
    }

    /// Start (or restart) a backfill watcher for a deployment.
    pub async fn watch(&self, deployment_id: &str) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let id = deployment_id.to_string();
        let store = self.store.clone();
        let chain = self.chain.clone();
        let gateway = self.gateway.clone();
        let interval = self.interval;
        let max_attempts = self.max_attempts;
        let global = self.global_shutdown.clone();

        let handle = tokio::spawn(async move {
            run_backfill_loop(&id, store, chain, gateway, interval, max_attempts, shutdown_rx, global)
                .await;
        });

        let mut slots = self.slots.write().await;
        if let Some(old) = slots.insert(
            deployment_id.to_string(),
            Slot {
                handle,
                shutdown_tx,
            },
        ) {
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
        }
        info!(deployment_id, "backfill watcher started");
    }

    /// Stop watching a deployment (it was closed or superseded).
    pub async fn stop_watch(&self, deployment_id: &str) {
        let mut slots = self.slots.write().await;
        if let Some(slot) = slots.remove(deployment_id) {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(deployment_id, "backfill watcher stopped");
        }
    }

    /// Stop all watchers (graceful shutdown).
    pub async fn stop_all(&self) {
        let mut slots = self.slots.write().await;
        for (id, slot) in slots.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(deployment_id = %id, "backfill watcher stopped");
        }
        info!("all backfill watchers stopped");
    }

    /// Re-launch watchers for deployments interrupted mid-backfill.
    ///
    /// Run once at startup: an `Active` deployment with no URIs means a
    /// previous process died before its backfill finished.
    pub async fn recover_interrupted(&self) -> usize {
        let interrupted = match self.store.active_deployments_missing_urls() {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "backfill recovery scan failed");
                return 0;
            }
        };
        let count = interrupted.len();
        for dep in interrupted {
            self.watch(&dep.id).await;
        }
        if count > 0 {
            info!(count, "recovered interrupted backfill watchers");
        }
        count
    }

    /// Deployment ids with an active watcher.
    pub async fn watching(&self) -> Vec<String> {
        let slots = self.slots.read().await;
        slots.keys().cloned().collect()
    }
}

/// The polling loop for one deployment.
#[allow(clippy::too_many_arguments)]
async fn run_backfill_loop(
    deployment_id: &str,
    store: StateStore,
    chain: Arc<dyn ChainClient>,
    gateway: Arc<dyn ProviderGateway>,
    interval: Duration,
    max_attempts: u32,
    mut shutdown: watch::Receiver<bool>,
    mut global_shutdown: watch::Receiver<bool>,
) {
    debug!(deployment_id, "backfill loop starting");

    for attempt in 0..max_attempts {
        // Re-read the row every iteration: a deployment closed out-of-band
        // stops the loop promptly instead of racing the close.
        let dep = match store.get_market_deployment(deployment_id) {
            Ok(Some(dep)) => dep,
            Ok(None) => {
                debug!(deployment_id, "deployment row gone, stopping backfill");
                return;
            }
            Err(e) => {
                warn!(deployment_id, error = %e, "backfill store read failed");
                return;
            }
        };
        if dep.status != MarketDeploymentStatus::Active {
            debug!(deployment_id, status = ?dep.status, "no longer active, stopping backfill");
            return;
        }
        if dep.has_urls() {
            // URIs appeared via another path.
            return;
        }

        let Some(provider) = dep.provider.clone() else {
            warn!(deployment_id, "active deployment has no provider, stopping backfill");
            return;
        };

        match poll_once(&store, &chain, &gateway, &dep, &provider).await {
            Ok(true) => {
                info!(deployment_id, attempt, "backfill found service URIs");
                return;
            }
            Ok(false) => {}
            Err(e) => {
                debug!(deployment_id, attempt, error = %e, "backfill poll failed");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {
                debug!(deployment_id, "backfill watcher shutting down");
                return;
            }
            _ = global_shutdown.changed() => {
                debug!(deployment_id, "backfill stopping on daemon shutdown");
                return;
            }
        }
    }
    debug!(deployment_id, "backfill attempts exhausted");
}

/// One status poll; persists URIs when they appear. Returns true when done.
async fn poll_once(
    store: &StateStore,
    chain: &Arc<dyn ChainClient>,
    gateway: &Arc<dyn ProviderGateway>,
    dep: &flotilla_state::MarketDeployment,
    provider: &str,
) -> Result<bool, String> {
    let provider_uri = chain
        .provider_uri(provider)
        .await
        .map_err(|e| e.to_string())?;
    let lease = LeaseRef {
        dseq: dep.dseq,
        gseq: dep.gseq,
        oseq: dep.oseq,
    };
    let urls = gateway
        .lease_status(&provider_uri, lease)
        .await
        .map_err(|e| e.to_string())?;

    if !urls.values().any(|uris| !uris.is_empty()) {
        return Ok(false);
    }

    let mut updated = dep.clone();
    updated.service_urls = urls;
    store
        .put_market_deployment(&updated)
        .map_err(|e| e.to_string())?;

    // Surface the URL on the owning service as well.
    if let Ok(Some(mut service)) = store.get_service(&dep.service_id) {
        if let Some(url) = updated.first_url() {
            service.invoke_url = Some(url.to_string());
            service.updated_at = epoch_secs();
            let _ = store.put_service(&service);
        }
    }
    Ok(true)
}

fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bids::Bid;
    use crate::error::{ChainError, GatewayError};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    struct StaticChain;

    #[async_trait]
    impl ChainClient for StaticChain {
        async fn account_address(&self) -> Result<String, ChainError> {
            Ok("owner1".to_string())
        }
        async fn create_deployment(
            &self,
            _sdl: &str,
            _deposit: u64,
        ) -> Result<serde_json::Value, ChainError> {
            unimplemented!()
        }
        async fn list_bids(&self, _owner: &str, _dseq: u64) -> Result<Vec<Bid>, ChainError> {
            unimplemented!()
        }
        async fn create_lease(
            &self,
            _owner: &str,
            _dseq: u64,
            _gseq: u32,
            _oseq: u32,
            _provider: &str,
        ) -> Result<(), ChainError> {
            unimplemented!()
        }
        async fn close_deployment(&self, _owner: &str, _dseq: u64) -> Result<(), ChainError> {
            Ok(())
        }
        async fn provider_uri(&self, provider: &str) -> Result<String, ChainError> {
            Ok(format!("https://{provider}.example"))
        }
    }

    /// Gateway that returns empty status a few times, then URIs.
    struct EventualGateway {
        remaining_empty: Mutex<u32>,
    }

    #[async_trait]
    impl ProviderGateway for EventualGateway {
        async fn send_manifest(
            &self,
            _provider_uri: &str,
            _lease: LeaseRef,
            _sdl: &str,
        ) -> Result<(), GatewayError> {
            Ok(())
        }
        async fn lease_status(
            &self,
            _provider_uri: &str,
            _lease: LeaseRef,
        ) -> Result<BTreeMap<String, Vec<String>>, GatewayError> {
            let mut remaining = self.remaining_empty.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(BTreeMap::new());
            }
            let mut urls = BTreeMap::new();
            urls.insert("web".to_string(), vec!["late.example:8080".to_string()]);
            Ok(urls)
        }
        async fn lease_logs(
            &self,
            _provider_uri: &str,
            _lease: LeaseRef,
            _tail: Option<u32>,
            _service: Option<&str>,
        ) -> Result<String, GatewayError> {
            Ok(String::new())
        }
    }

    fn seed(store: &StateStore, id: &str, status: MarketDeploymentStatus) {
        let service = flotilla_state::Service {
            id: "svc-1".to_string(),
            service_type: flotilla_state::ServiceType::Function,
            slug: "foo".to_string(),
            project_id: "p".to_string(),
            organization_id: "org-1".to_string(),
            status: flotilla_state::ServiceStatus::Active,
            invoke_url: None,
            source_config: "cfg".to_string(),
            created_at: 0,
            updated_at: 0,
        };
        store.put_service(&service).unwrap();
        let dep = flotilla_state::MarketDeployment {
            id: id.to_string(),
            service_id: "svc-1".to_string(),
            owner: "owner1".to_string(),
            dseq: 1000,
            sdl_content: "sdl".to_string(),
            provider: Some("p1".to_string()),
            gseq: 1,
            oseq: 1,
            price_per_unit: Some(1.0),
            deposit_amount: 0,
            status,
            service_urls: BTreeMap::new(),
            error_message: None,
            created_at: 0,
            deployed_at: Some(0),
            closed_at: None,
        };
        store.put_market_deployment(&dep).unwrap();
    }

    fn supervisor(store: StateStore, empty_rounds: u32) -> BackfillSupervisor {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive for the supervisor's lifetime; otherwise
        // dropping it closes the channel and the loop's `global_shutdown`
        // branch fires an immediate shutdown.
        std::mem::forget(tx);
        BackfillSupervisor::new(
            store,
            Arc::new(StaticChain),
            Arc::new(EventualGateway {
                remaining_empty: Mutex::new(empty_rounds),
            }),
            rx,
        )
        .with_timing(Duration::from_millis(1), 10)
    }

    #[tokio::test]
    async fn backfill_persists_late_uris() {
        let store = StateStore::open_in_memory().unwrap();
        seed(&store, "mkt-1000", MarketDeploymentStatus::Active);
        let supervisor = supervisor(store.clone(), 2);

        supervisor.watch("mkt-1000").await;

        // Give the loop a few ticks to find the URIs.
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(2)).await;
            let dep = store.get_market_deployment("mkt-1000").unwrap().unwrap();
            if dep.has_urls() {
                break;
            }
        }

        let dep = store.get_market_deployment("mkt-1000").unwrap().unwrap();
        assert!(dep.has_urls());
        let service = store.get_service("svc-1").unwrap().unwrap();
        assert_eq!(service.invoke_url.as_deref(), Some("late.example:8080"));
    }

    #[tokio::test]
    async fn backfill_stops_when_deployment_no_longer_active() {
        let store = StateStore::open_in_memory().unwrap();
        seed(&store, "mkt-1000", MarketDeploymentStatus::Closed);
        let supervisor = supervisor(store.clone(), 0);

        supervisor.watch("mkt-1000").await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The loop bailed on the closed row without writing URIs.
        let dep = store.get_market_deployment("mkt-1000").unwrap().unwrap();
        assert!(!dep.has_urls());
    }

    #[tokio::test]
    async fn recovery_scan_watches_interrupted_deployments() {
        let store = StateStore::open_in_memory().unwrap();
        seed(&store, "mkt-1000", MarketDeploymentStatus::Active);
        let supervisor = supervisor(store.clone(), 0);

        let recovered = supervisor.recover_interrupted().await;
        assert_eq!(recovered, 1);
        assert_eq!(supervisor.watching().await, vec!["mkt-1000".to_string()]);

        supervisor.stop_all().await;
        assert!(supervisor.watching().await.is_empty());
    }
}
