//! Marketplace deploy state machine.
//!
//! `deploy()` walks a linear progression — close stale, create on-chain,
//! wait for bids, select, lease, deliver manifest, poll for URIs — with
//! bounded retries and backoff at each step. Every polling loop re-checks
//! both the shutdown signal and the deployment row's current status, so an
//! out-of-band close or daemon shutdown stops the machine promptly instead
//! of completing a now-irrelevant lease/manifest sequence.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, watch};
use tracing::{debug, info, warn};

use flotilla_provider::{DeployOptions, DeployShape, DeploymentResult};
use flotilla_state::{
    MarketDeployment, MarketDeploymentStatus, Service, ServiceStatus, StateStore,
};

use crate::backfill::BackfillSupervisor;
use crate::bids::{DenyPolicy, select};
use crate::chain::{ChainClient, parse_dseq};
use crate::error::{MarketError, MarketResult};
use crate::gateway::{LeaseRef, ProviderGateway};

/// Tuning for the deploy state machine.
#[derive(Debug, Clone)]
pub struct MarketConfig {
    /// Deposit submitted with deployment-create when the caller gives none.
    pub default_deposit: u64,
    /// Base delay for the bid polling backoff (attempt i waits base × (i+1)).
    pub bid_base_delay: Duration,
    pub bid_max_attempts: u32,
    /// Leases must be chain-confirmed before manifest delivery.
    pub lease_settle_delay: Duration,
    /// Delay before the single manifest-send retry.
    pub manifest_retry_delay: Duration,
    pub uri_poll_interval: Duration,
    pub uri_poll_attempts: u32,
    pub deny_policy: DenyPolicy,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            default_deposit: 500_000,
            bid_base_delay: Duration::from_secs(5),
            bid_max_attempts: 10,
            lease_settle_delay: Duration::from_secs(10),
            manifest_retry_delay: Duration::from_secs(5),
            uri_poll_interval: Duration::from_secs(5),
            uri_poll_attempts: 24,
            deny_policy: DenyPolicy::default(),
        }
    }
}

/// Turns a service description into marketplace SDL.
///
/// The real compiler lives in the CRUD layer; the orchestrator only needs
/// this seam.
pub trait ManifestCompiler: Send + Sync {
    fn compile(&self, service: &Service) -> MarketResult<String>;
}

/// Pass-through compiler: the service's source configuration is already SDL.
pub struct SourceConfigCompiler;

impl ManifestCompiler for SourceConfigCompiler {
    fn compile(&self, service: &Service) -> MarketResult<String> {
        if service.source_config.trim().is_empty() {
            return Err(MarketError::Manifest(format!(
                "service {} has no source configuration",
                service.id
            )));
        }
        Ok(service.source_config.clone())
    }
}

/// Escrow creation request handed to the billing layer after a successful
/// deploy.
#[derive(Debug, Clone)]
pub struct EscrowRequest {
    pub market_deployment_id: String,
    pub organization_id: String,
    pub price_per_unit: f64,
    pub deposit_amount: u64,
}

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Callback opening an escrow for a fresh deployment.
///
/// The callback swallows its own failures: a missing escrow must never
/// abort an otherwise-successful deployment, since compute is already
/// running.
pub type EscrowHook = Arc<dyn Fn(EscrowRequest) -> BoxFuture + Send + Sync>;

/// Drives marketplace deployments end to end.
pub struct MarketOrchestrator {
    store: StateStore,
    chain: Arc<dyn ChainClient>,
    gateway: Arc<dyn ProviderGateway>,
    compiler: Arc<dyn ManifestCompiler>,
    config: MarketConfig,
    /// Per-service mutex serializing close-then-create. Two concurrent
    /// deploys of the same service would otherwise race the single-active
    /// invariant.
    locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    backfill: BackfillSupervisor,
    escrow_hook: OnceLock<EscrowHook>,
    shutdown: watch::Receiver<bool>,
}

impl MarketOrchestrator {
    pub fn new(
        store: StateStore,
        chain: Arc<dyn ChainClient>,
        gateway: Arc<dyn ProviderGateway>,
        compiler: Arc<dyn ManifestCompiler>,
        config: MarketConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let backfill = BackfillSupervisor::new(
            store.clone(),
            chain.clone(),
            gateway.clone(),
            shutdown.clone(),
        );
        Self {
            store,
            chain,
            gateway,
            compiler,
            config,
            locks: StdMutex::new(HashMap::new()),
            backfill,
            escrow_hook: OnceLock::new(),
            shutdown,
        }
    }

    /// Install the escrow creation callback. Set once at startup.
    pub fn set_escrow_hook(&self, hook: EscrowHook) {
        if self.escrow_hook.set(hook).is_err() {
            warn!("escrow hook already installed, ignoring replacement");
        }
    }

    /// The URI backfill supervisor (startup recovery, graceful shutdown).
    pub fn backfill(&self) -> &BackfillSupervisor {
        &self.backfill
    }

    fn service_lock(&self, service_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().expect("service locks");
        locks
            .entry(service_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Sleep unless shutdown fires first. Returns true when cancelled.
    async fn sleep_cancellable(&self, duration: Duration) -> bool {
        let mut rx = self.shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = rx.changed() => true,
        }
    }

    fn update_service(
        &self,
        service_id: &str,
        status: ServiceStatus,
        invoke_url: Option<String>,
    ) -> MarketResult<()> {
        let mut service = self
            .store
            .get_service(service_id)?
            .ok_or_else(|| MarketError::ServiceNotFound(service_id.to_string()))?;
        service.status = status;
        if invoke_url.is_some() {
            service.invoke_url = invoke_url;
        }
        service.updated_at = epoch_secs();
        self.store.put_service(&service)?;
        Ok(())
    }

    /// Deploy a service onto the marketplace.
    ///
    /// Serialized per service; at most one `Active` deployment survives.
    pub async fn deploy(
        &self,
        service_id: &str,
        options: DeployOptions,
    ) -> MarketResult<DeploymentResult> {
        let lock = self.service_lock(service_id);
        let _guard = lock.lock().await;

        let service = self
            .store
            .get_service(service_id)?
            .ok_or_else(|| MarketError::ServiceNotFound(service_id.to_string()))?;

        let sdl = match &options.manifest {
            Some(manifest) => manifest.clone(),
            None => self.compiler.compile(&service)?,
        };

        // Pre-empt any live deployment for this service. The row is forced
        // to Closed even when the on-chain close fails: the record is stale
        // either way.
        if let Some(stale) = self.store.active_market_deployment(service_id)? {
            self.force_close(stale).await?;
        }

        self.update_service(service_id, ServiceStatus::Deploying, None)?;

        let deposit = options.deposit.unwrap_or(self.config.default_deposit);
        match self
            .run_machine(&service, &sdl, deposit, options.shape)
            .await
        {
            Ok((deployment, price)) => {
                let invoke_url = deployment.first_url().map(str::to_string);
                self.update_service(service_id, ServiceStatus::Active, invoke_url.clone())?;

                if let Some(hook) = self.escrow_hook.get() {
                    hook(EscrowRequest {
                        market_deployment_id: deployment.id.clone(),
                        organization_id: service.organization_id.clone(),
                        price_per_unit: price,
                        deposit_amount: deposit,
                    })
                    .await;
                }

                info!(
                    service_id,
                    deployment_id = %deployment.id,
                    dseq = deployment.dseq,
                    provider = deployment.provider.as_deref().unwrap_or("-"),
                    "marketplace deployment active"
                );
                Ok(DeploymentResult {
                    deployment_id: deployment.id.clone(),
                    service_urls: deployment.service_urls.clone(),
                    invoke_url,
                })
            }
            Err(err) => {
                // The service reflects the failure even when it happened
                // before a deployment row existed.
                let _ = self.update_service(service_id, ServiceStatus::Failed, None);
                Err(err)
            }
        }
    }

    /// Steps 3–10: create on-chain, bid, lease, manifest, poll.
    async fn run_machine(
        &self,
        service: &Service,
        sdl: &str,
        deposit: u64,
        shape: DeployShape,
    ) -> MarketResult<(MarketDeployment, f64)> {
        let owner = self.chain.account_address().await?;

        let tx = self.chain.create_deployment(sdl, deposit).await?;
        let dseq = parse_dseq(&tx).ok_or_else(|| {
            MarketError::DeploymentCreationFailed(
                "no positive integer dseq in deployment-create response".to_string(),
            )
        })?;

        let mut dep = MarketDeployment {
            id: format!("mkt-{dseq}"),
            service_id: service.id.clone(),
            owner: owner.clone(),
            dseq,
            sdl_content: sdl.to_string(),
            provider: None,
            gseq: 0,
            oseq: 0,
            price_per_unit: None,
            deposit_amount: deposit,
            status: MarketDeploymentStatus::WaitingBids,
            service_urls: Default::default(),
            error_message: None,
            created_at: epoch_secs(),
            deployed_at: None,
            closed_at: None,
        };
        self.store.put_market_deployment(&dep)?;
        info!(deployment_id = %dep.id, dseq, "on-chain deployment created, waiting for bids");

        // From here on every failure lands on the persisted row.
        match self.drive(&mut dep, shape).await {
            Ok(price) => Ok((dep, price)),
            Err(err) => {
                dep.status = MarketDeploymentStatus::Failed;
                dep.error_message = Some(err.to_string());
                self.store.put_market_deployment(&dep)?;
                warn!(deployment_id = %dep.id, error = %err, "marketplace deployment failed");
                Err(err)
            }
        }
    }

    async fn drive(&self, dep: &mut MarketDeployment, shape: DeployShape) -> MarketResult<f64> {
        // Step 5: poll for bids with increasing linear backoff.
        let bids = self.wait_for_bids(dep).await?;

        // Step 6: filter and select.
        dep.status = MarketDeploymentStatus::SelectingBid;
        self.store.put_market_deployment(dep)?;

        let selection = select(&bids, shape, &self.config.deny_policy);
        let winner = selection
            .cheapest()
            .ok_or(MarketError::NoSafeBidsAvailable {
                rejected: selection.rejected.len(),
            })?
            .clone();
        let price = winner.price.expect("safe bids carry a parsed price");
        debug!(
            deployment_id = %dep.id,
            provider = %winner.bid.provider,
            price,
            rejected = selection.rejected.len(),
            "bid selected"
        );

        // Step 7: lease.
        dep.provider = Some(winner.bid.provider.clone());
        dep.gseq = winner.bid.gseq;
        dep.oseq = winner.bid.oseq;
        dep.price_per_unit = Some(price);
        dep.status = MarketDeploymentStatus::CreatingLease;
        self.store.put_market_deployment(dep)?;

        self.chain
            .create_lease(&dep.owner, dep.dseq, dep.gseq, dep.oseq, &winner.bid.provider)
            .await
            .map_err(|e| MarketError::LeaseCreationFailed(e.to_string()))?;

        if self.sleep_cancellable(self.config.lease_settle_delay).await {
            return Err(MarketError::Cancelled);
        }

        // Step 8: manifest, one retry.
        dep.status = MarketDeploymentStatus::SendingManifest;
        self.store.put_market_deployment(dep)?;
        let provider_uri = self.chain.provider_uri(&winner.bid.provider).await?;
        self.send_manifest_with_retry(dep, &provider_uri).await?;

        // Step 9: poll for service URIs, bounded.
        dep.status = MarketDeploymentStatus::Deploying;
        self.store.put_market_deployment(dep)?;
        let urls = self.poll_service_urls(dep, &provider_uri).await?;

        // Step 10: active, URIs possibly still empty.
        dep.service_urls = urls;
        dep.status = MarketDeploymentStatus::Active;
        dep.deployed_at = Some(epoch_secs());
        self.store.put_market_deployment(dep)?;

        if !dep.has_urls() {
            info!(deployment_id = %dep.id, "no service URIs yet, scheduling backfill");
            self.backfill.watch(&dep.id).await;
        }

        Ok(price)
    }

    async fn wait_for_bids(&self, dep: &MarketDeployment) -> MarketResult<Vec<crate::bids::Bid>> {
        for attempt in 0..self.config.bid_max_attempts {
            let delay = self.config.bid_base_delay * (attempt + 1);
            if self.sleep_cancellable(delay).await {
                return Err(MarketError::Cancelled);
            }

            match self.chain.list_bids(&dep.owner, dep.dseq).await {
                Ok(bids) if !bids.is_empty() => {
                    debug!(
                        deployment_id = %dep.id,
                        attempt,
                        count = bids.len(),
                        "bids observed"
                    );
                    return Ok(bids);
                }
                Ok(_) => {
                    debug!(deployment_id = %dep.id, attempt, "no bids yet");
                }
                Err(e) => {
                    // Transient query failures consume an attempt.
                    warn!(deployment_id = %dep.id, attempt, error = %e, "bid query failed");
                }
            }
        }
        Err(MarketError::NoBidsReceived {
            attempts: self.config.bid_max_attempts,
        })
    }

    async fn send_manifest_with_retry(
        &self,
        dep: &MarketDeployment,
        provider_uri: &str,
    ) -> MarketResult<()> {
        let lease = LeaseRef {
            dseq: dep.dseq,
            gseq: dep.gseq,
            oseq: dep.oseq,
        };
        match self
            .gateway
            .send_manifest(provider_uri, lease, &dep.sdl_content)
            .await
        {
            Ok(()) => return Ok(()),
            Err(first) => {
                // Providers are occasionally not ready right after lease
                // confirmation; retry exactly once after a short delay.
                warn!(deployment_id = %dep.id, error = %first, "manifest send failed, retrying once");
                if self.sleep_cancellable(self.config.manifest_retry_delay).await {
                    return Err(MarketError::Cancelled);
                }
            }
        }
        self.gateway
            .send_manifest(provider_uri, lease, &dep.sdl_content)
            .await
            .map_err(|e| MarketError::ManifestSendFailed(e.to_string()))
    }

    async fn poll_service_urls(
        &self,
        dep: &MarketDeployment,
        provider_uri: &str,
    ) -> MarketResult<std::collections::BTreeMap<String, Vec<String>>> {
        let lease = LeaseRef {
            dseq: dep.dseq,
            gseq: dep.gseq,
            oseq: dep.oseq,
        };
        let mut last = Default::default();

        for attempt in 0..self.config.uri_poll_attempts {
            if self.is_shutdown() {
                return Err(MarketError::Cancelled);
            }
            // An out-of-band close stops the machine promptly.
            if let Some(current) = self.store.get_market_deployment(&dep.id)? {
                if current.status == MarketDeploymentStatus::Closed {
                    return Err(MarketError::Cancelled);
                }
            }

            match self.gateway.lease_status(provider_uri, lease).await {
                Ok(urls) => {
                    if urls.values().any(|uris| !uris.is_empty()) {
                        return Ok(urls);
                    }
                    last = urls;
                }
                Err(e) => {
                    debug!(deployment_id = %dep.id, attempt, error = %e, "lease status not ready");
                }
            }

            if self.sleep_cancellable(self.config.uri_poll_interval).await {
                return Err(MarketError::Cancelled);
            }
        }
        // Not a failure: ingress on some providers is slow. The caller
        // schedules a backfill instead of blocking.
        Ok(last)
    }

    /// Close a deployment. Idempotent: closing a closed deployment is a
    /// no-op.
    pub async fn close(&self, deployment_id: &str) -> MarketResult<()> {
        let dep = self
            .store
            .get_market_deployment(deployment_id)?
            .ok_or_else(|| MarketError::DeploymentNotFound(deployment_id.to_string()))?;
        if dep.status == MarketDeploymentStatus::Closed {
            return Ok(());
        }
        self.force_close(dep).await
    }

    /// Best-effort on-chain close; the row is marked Closed regardless.
    async fn force_close(&self, mut dep: MarketDeployment) -> MarketResult<()> {
        if let Err(e) = self.chain.close_deployment(&dep.owner, dep.dseq).await {
            warn!(
                deployment_id = %dep.id,
                error = %e,
                "on-chain close failed, forcing row closed anyway"
            );
        }
        dep.status = MarketDeploymentStatus::Closed;
        dep.closed_at = Some(epoch_secs());
        self.store.put_market_deployment(&dep)?;
        self.backfill.stop_watch(&dep.id).await;
        info!(deployment_id = %dep.id, "marketplace deployment closed");
        Ok(())
    }

    /// Current deployment row.
    pub fn get(&self, deployment_id: &str) -> MarketResult<MarketDeployment> {
        self.store
            .get_market_deployment(deployment_id)?
            .ok_or_else(|| MarketError::DeploymentNotFound(deployment_id.to_string()))
    }

    /// Workload logs via the provider gateway.
    pub async fn logs(
        &self,
        deployment_id: &str,
        tail: Option<u32>,
        service: Option<&str>,
    ) -> MarketResult<String> {
        let dep = self.get(deployment_id)?;
        let provider = dep.provider.clone().ok_or_else(|| {
            MarketError::DeploymentNotFound(format!("{deployment_id} has no lease yet"))
        })?;
        let provider_uri = self.chain.provider_uri(&provider).await?;
        let lease = LeaseRef {
            dseq: dep.dseq,
            gseq: dep.gseq,
            oseq: dep.oseq,
        };
        Ok(self
            .gateway
            .lease_logs(&provider_uri, lease, tail, service)
            .await?)
    }
}

fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
