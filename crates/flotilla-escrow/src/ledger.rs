//! The escrow ledger.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use flotilla_provider::{DeployOptions, ProviderError, ProviderRegistry};
use flotilla_state::{
    Escrow, EscrowStatus, MarketDeploymentStatus, StateStore, TeeDeployment, TeeDeploymentStatus,
};

use crate::error::{EscrowError, EscrowResult};

const SECS_PER_DAY: u64 = 86_400;

/// Billing policy for the ledger.
#[derive(Debug, Clone)]
pub struct EscrowConfig {
    /// Organizational margin on top of the raw provider price.
    pub margin_rate: f64,
    /// Price units consumed per day (the marketplace bills per block;
    /// ~6s blocks make 14_400 of them a day).
    pub units_per_day: u64,
    /// Conversion from one price unit to cents.
    pub cents_per_unit: f64,
    /// Registry names of the two backends.
    pub market_provider: String,
    pub tee_provider: String,
}

impl Default for EscrowConfig {
    fn default() -> Self {
        Self {
            margin_rate: 0.10,
            units_per_day: 14_400,
            cents_per_unit: 0.001,
            market_provider: "market".to_string(),
            tee_provider: "tee".to_string(),
        }
    }
}

/// Arguments for opening an escrow against a fresh deployment.
#[derive(Debug, Clone)]
pub struct CreateEscrow {
    pub market_deployment_id: String,
    pub organization_id: String,
    /// Winning bid price per unit.
    pub price_per_unit: f64,
    /// On-chain deposit in price units.
    pub deposit_amount: u64,
}

/// Outcome of a top-up driven resume attempt.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ResumeOutcome {
    /// Every paused deployment was resumed.
    Resumed { deployments: Vec<String> },
    /// The new balance does not cover one day of combined burn; nothing
    /// was resumed.
    InsufficientBalance {
        required_cents: u64,
        available_cents: u64,
    },
    /// The organization has nothing paused.
    NothingPaused,
}

/// Tracks prepaid deployment balances and drives pause/resume.
pub struct EscrowLedger {
    store: StateStore,
    registry: Arc<ProviderRegistry>,
    config: EscrowConfig,
}

impl EscrowLedger {
    pub fn new(store: StateStore, registry: Arc<ProviderRegistry>, config: EscrowConfig) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    /// Daily burn in cents for a given per-unit price, margin included.
    fn daily_rate_cents(&self, price_per_unit: f64) -> u64 {
        let raw = price_per_unit
            * self.config.units_per_day as f64
            * self.config.cents_per_unit
            * (1.0 + self.config.margin_rate);
        raw.ceil().max(0.0) as u64
    }

    /// Open an `Active` escrow for a fresh deployment.
    pub fn create_escrow(&self, req: CreateEscrow) -> EscrowResult<Escrow> {
        let deposit_cents =
            (req.deposit_amount as f64 * self.config.cents_per_unit).ceil() as u64;
        let escrow = Escrow {
            id: format!("esc-{}", req.market_deployment_id),
            market_deployment_id: req.market_deployment_id,
            organization_id: req.organization_id,
            deposit_cents,
            consumed_cents: 0,
            daily_rate_cents: self.daily_rate_cents(req.price_per_unit),
            status: EscrowStatus::Active,
            created_at: epoch_secs(),
            updated_at: epoch_secs(),
        };
        self.store.put_escrow(&escrow)?;
        info!(
            escrow_id = %escrow.id,
            deposit_cents,
            daily_rate_cents = escrow.daily_rate_cents,
            "escrow opened"
        );
        Ok(escrow)
    }

    /// Consume elapsed time against an escrow.
    ///
    /// `consumed_cents` never exceeds `deposit_cents`: a violating update
    /// clamps, the escrow transitions to `Depleted`, and the linked
    /// deployment is paused.
    pub async fn consume(&self, escrow_id: &str, elapsed: Duration) -> EscrowResult<Escrow> {
        let mut escrow = self
            .store
            .get_escrow(escrow_id)?
            .ok_or_else(|| EscrowError::NotFound(escrow_id.to_string()))?;
        if escrow.status != EscrowStatus::Active {
            return Ok(escrow);
        }

        let delta =
            (escrow.daily_rate_cents as u128 * elapsed.as_secs() as u128).div_ceil(SECS_PER_DAY as u128) as u64;
        let depleted = escrow.consumed_cents.saturating_add(delta) >= escrow.deposit_cents;

        if depleted {
            escrow.consumed_cents = escrow.deposit_cents;
            escrow.status = EscrowStatus::Depleted;
        } else {
            escrow.consumed_cents += delta;
        }
        escrow.updated_at = epoch_secs();
        self.store.put_escrow(&escrow)?;
        debug!(
            escrow_id,
            delta,
            consumed = escrow.consumed_cents,
            deposit = escrow.deposit_cents,
            "escrow consumed"
        );

        if depleted {
            warn!(escrow_id, "escrow depleted, pausing deployment");
            self.pause_deployment(&escrow.market_deployment_id).await?;
        }
        Ok(escrow)
    }

    /// Pause every `Active` escrow for an organization (its balance went
    /// negative upstream).
    pub async fn pause_for_organization(&self, organization_id: &str) -> EscrowResult<Vec<String>> {
        let mut paused = Vec::new();
        for mut escrow in self
            .store
            .escrows_for_organization(organization_id)?
            .into_iter()
            .filter(|e| e.status == EscrowStatus::Active)
        {
            self.pause_deployment(&escrow.market_deployment_id).await?;
            escrow.status = EscrowStatus::Paused;
            escrow.updated_at = epoch_secs();
            self.store.put_escrow(&escrow)?;
            paused.push(escrow.market_deployment_id.clone());
        }
        Ok(paused)
    }

    /// Stop-else-close the deployment behind an escrow and mark its row
    /// `Suspended` so a later top-up can find it.
    async fn pause_deployment(&self, deployment_id: &str) -> EscrowResult<()> {
        let provider = self.registry.get(&self.config.market_provider)?;
        match provider.stop(deployment_id).await {
            Ok(()) => {}
            Err(ProviderError::UnsupportedOperation { .. }) => {
                provider.close(deployment_id).await?;
            }
            Err(e) => return Err(e.into()),
        }

        // The orchestrator's close marks the row Closed; re-mark it
        // Suspended so resume can distinguish it from a deliberate close.
        if let Some(mut dep) = self.store.get_market_deployment(deployment_id)? {
            dep.status = MarketDeploymentStatus::Suspended;
            self.store.put_market_deployment(&dep)?;
        }
        Ok(())
    }

    /// Combined daily burn of everything paused for an organization.
    fn combined_daily_burn(
        &self,
        paused_escrows: &[Escrow],
        stopped_tee: &[TeeDeployment],
    ) -> u64 {
        let market: u64 = paused_escrows.iter().map(|e| e.daily_rate_cents).sum();
        let tee: u64 = stopped_tee.iter().map(|d| d.hourly_rate_cents * 24).sum();
        market + tee
    }

    /// Resume an organization's paused deployments after a top-up.
    ///
    /// All-or-nothing: unless the new balance covers at least one full day
    /// of the combined burn, nothing is resumed. Marketplace deployments
    /// redeploy from their saved manifest (a fresh escrow opens through the
    /// deploy path); TEE deployments restart in place.
    pub async fn resume_if_funded(
        &self,
        organization_id: &str,
        new_balance_cents: u64,
    ) -> EscrowResult<ResumeOutcome> {
        let paused_escrows: Vec<Escrow> = self
            .store
            .escrows_for_organization(organization_id)?
            .into_iter()
            .filter(|e| matches!(e.status, EscrowStatus::Paused | EscrowStatus::Depleted))
            .collect();
        let stopped_tee = self.stopped_tee_deployments(organization_id)?;

        if paused_escrows.is_empty() && stopped_tee.is_empty() {
            return Ok(ResumeOutcome::NothingPaused);
        }

        let required_cents = self.combined_daily_burn(&paused_escrows, &stopped_tee);
        if new_balance_cents < required_cents {
            info!(
                organization_id,
                required_cents, new_balance_cents, "top-up below combined burn, not resuming"
            );
            return Ok(ResumeOutcome::InsufficientBalance {
                required_cents,
                available_cents: new_balance_cents,
            });
        }

        let mut resumed = Vec::new();

        let market = self.registry.get(&self.config.market_provider)?;
        for mut escrow in paused_escrows {
            let Some(dep) = self
                .store
                .get_market_deployment(&escrow.market_deployment_id)?
            else {
                warn!(escrow_id = %escrow.id, "paused escrow points at a missing deployment");
                continue;
            };
            // Redeploy from the saved manifest. The deploy path closes the
            // suspended row and opens a fresh escrow via its billing hook.
            let options = DeployOptions {
                manifest: Some(dep.sdl_content.clone()),
                deposit: Some(dep.deposit_amount),
                ..Default::default()
            };
            match market.deploy(&dep.service_id, options).await {
                Ok(result) => {
                    escrow.status = EscrowStatus::Refunded;
                    escrow.updated_at = epoch_secs();
                    self.store.put_escrow(&escrow)?;
                    resumed.push(result.deployment_id);
                }
                Err(e) => {
                    warn!(
                        deployment_id = %dep.id,
                        error = %e,
                        "resume redeploy failed, escrow left paused"
                    );
                }
            }
        }

        if !stopped_tee.is_empty() {
            let tee = self.registry.get(&self.config.tee_provider)?;
            for dep in stopped_tee {
                match tee.start(&dep.id).await {
                    Ok(()) => resumed.push(dep.id),
                    Err(e) => {
                        warn!(deployment_id = %dep.id, error = %e, "tee resume failed");
                    }
                }
            }
        }

        info!(organization_id, count = resumed.len(), "resumed paused deployments");
        Ok(ResumeOutcome::Resumed {
            deployments: resumed,
        })
    }

    fn stopped_tee_deployments(&self, organization_id: &str) -> EscrowResult<Vec<TeeDeployment>> {
        let mut stopped = Vec::new();
        for service in self
            .store
            .list_services()?
            .into_iter()
            .filter(|s| s.organization_id == organization_id)
        {
            stopped.extend(
                self.store
                    .tee_deployments_for_service(&service.id)?
                    .into_iter()
                    .filter(|d| d.status == TeeDeploymentStatus::Stopped),
            );
        }
        Ok(stopped)
    }

    /// Billing ticker: periodically consume elapsed time on every active
    /// escrow. Runs until the shutdown signal fires.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "escrow billing ticker started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    info!("escrow billing ticker stopped");
                    return;
                }
            }
        }
    }

    /// One billing pass over all active escrows.
    pub async fn tick(&self) {
        let escrows = match self.store.active_escrows() {
            Ok(escrows) => escrows,
            Err(e) => {
                warn!(error = %e, "billing tick failed to list escrows");
                return;
            }
        };
        let now = epoch_secs();
        for escrow in escrows {
            let elapsed = Duration::from_secs(now.saturating_sub(escrow.updated_at));
            if elapsed.is_zero() {
                continue;
            }
            if let Err(e) = self.consume(&escrow.id, elapsed).await {
                warn!(escrow_id = %escrow.id, error = %e, "billing consume failed");
            }
        }
    }
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
    use async_trait::async_trait;
    use flotilla_provider::{
        BillingModel, Capabilities, ConfigFormat, DeploymentProvider, DeploymentResult,
        LogOptions, ProviderResult, StatusReport,
    };
    use flotilla_state::{MarketDeployment, Service, ServiceStatus, ServiceType};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Marketplace stand-in: close marks the row Closed like the real
    /// orchestrator; deploy records the call and fabricates a fresh row.
    struct StubMarket {
        store: StateStore,
        deploys: AtomicU32,
        closes: AtomicU32,
    }

    #[async_trait]
    impl DeploymentProvider for StubMarket {
        fn name(&self) -> &'static str {
            "market"
        }
        fn is_available(&self) -> bool {
            true
        }
        async fn deploy(
            &self,
            service_id: &str,
            _options: DeployOptions,
        ) -> ProviderResult<DeploymentResult> {
            let n = self.deploys.fetch_add(1, Ordering::SeqCst);
            let id = format!("mkt-new-{n}");
            let dep = MarketDeployment {
                id: id.clone(),
                service_id: service_id.to_string(),
                owner: "owner1".to_string(),
                dseq: 2000 + n as u64,
                sdl_content: "sdl".to_string(),
                provider: Some("p1".to_string()),
                gseq: 1,
                oseq: 1,
                price_per_unit: Some(1.0),
                deposit_amount: 100_000,
                status: MarketDeploymentStatus::Active,
                service_urls: BTreeMap::new(),
                error_message: None,
                created_at: 99_999,
                deployed_at: Some(99_999),
                closed_at: None,
            };
            self.store.put_market_deployment(&dep).unwrap();
            Ok(DeploymentResult {
                deployment_id: id,
                service_urls: BTreeMap::new(),
                invoke_url: None,
            })
        }
        async fn stop(&self, _deployment_id: &str) -> ProviderResult<()> {
            Err(flotilla_provider::ProviderError::UnsupportedOperation {
                provider: "market",
                operation: "stop",
            })
        }
        async fn start(&self, _deployment_id: &str) -> ProviderResult<()> {
            Err(flotilla_provider::ProviderError::UnsupportedOperation {
                provider: "market",
                operation: "start",
            })
        }
        async fn close(&self, deployment_id: &str) -> ProviderResult<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if let Some(mut dep) = self.store.get_market_deployment(deployment_id).unwrap() {
                dep.status = MarketDeploymentStatus::Closed;
                self.store.put_market_deployment(&dep).unwrap();
            }
            Ok(())
        }
        async fn status(&self, _deployment_id: &str) -> ProviderResult<StatusReport> {
            unimplemented!()
        }
        async fn logs(&self, _deployment_id: &str, _options: LogOptions) -> ProviderResult<String> {
            unimplemented!()
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities {
                supports_stop: false,
                supports_start: false,
                supports_tee: false,
                billing: BillingModel::PerBlockEscrow,
                config_format: ConfigFormat::Sdl,
            }
        }
    }

    fn seed_deployment(store: &StateStore, id: &str, status: MarketDeploymentStatus) {
        store
            .put_service(&Service {
                id: "svc-1".to_string(),
                service_type: ServiceType::Function,
                slug: "foo".to_string(),
                project_id: "p".to_string(),
                organization_id: "org-1".to_string(),
                status: ServiceStatus::Active,
                invoke_url: None,
                source_config: "cfg".to_string(),
                created_at: 0,
                updated_at: 0,
            })
            .unwrap();
        store
            .put_market_deployment(&MarketDeployment {
                id: id.to_string(),
                service_id: "svc-1".to_string(),
                owner: "owner1".to_string(),
                dseq: 1000,
                sdl_content: "sdl".to_string(),
                provider: Some("p1".to_string()),
                gseq: 1,
                oseq: 1,
                price_per_unit: Some(1.0),
                deposit_amount: 100_000,
                status,
                service_urls: BTreeMap::new(),
                error_message: None,
                created_at: 0,
                deployed_at: Some(0),
                closed_at: None,
            })
            .unwrap();
    }

    fn ledger(store: StateStore) -> (EscrowLedger, Arc<StubMarket>) {
        let stub = Arc::new(StubMarket {
            store: store.clone(),
            deploys: AtomicU32::new(0),
            closes: AtomicU32::new(0),
        });
        let mut registry = ProviderRegistry::new();
        registry.register(stub.clone());
        let ledger = EscrowLedger::new(store, Arc::new(registry), EscrowConfig::default());
        (ledger, stub)
    }

    #[test]
    fn daily_rate_includes_margin() {
        let store = StateStore::open_in_memory().unwrap();
        let (ledger, _) = ledger(store);
        // 1.0 unit price × 14_400 units × 0.001 cents × 1.1 = 15.84 → 16.
        assert_eq!(ledger.daily_rate_cents(1.0), 16);
        assert_eq!(ledger.daily_rate_cents(0.0), 0);
    }

    #[test]
    fn create_escrow_opens_active_with_zero_consumed() {
        let store = StateStore::open_in_memory().unwrap();
        let (ledger, _) = ledger(store.clone());
        let escrow = ledger
            .create_escrow(CreateEscrow {
                market_deployment_id: "mkt-1000".to_string(),
                organization_id: "org-1".to_string(),
                price_per_unit: 1.0,
                deposit_amount: 100_000,
            })
            .unwrap();

        assert_eq!(escrow.status, EscrowStatus::Active);
        assert_eq!(escrow.consumed_cents, 0);
        assert_eq!(escrow.deposit_cents, 100); // 100_000 × 0.001
        assert!(store.get_escrow("esc-mkt-1000").unwrap().is_some());
    }

    #[tokio::test]
    async fn consume_accrues_without_depleting() {
        let store = StateStore::open_in_memory().unwrap();
        seed_deployment(&store, "mkt-1000", MarketDeploymentStatus::Active);
        let (ledger, stub) = ledger(store.clone());
        ledger
            .create_escrow(CreateEscrow {
                market_deployment_id: "mkt-1000".to_string(),
                organization_id: "org-1".to_string(),
                price_per_unit: 1.0,
                deposit_amount: 100_000,
            })
            .unwrap();

        // Half a day at 16 cents/day: 8 cents.
        let escrow = ledger
            .consume("esc-mkt-1000", Duration::from_secs(SECS_PER_DAY / 2))
            .await
            .unwrap();
        assert_eq!(escrow.consumed_cents, 8);
        assert_eq!(escrow.status, EscrowStatus::Active);
        assert_eq!(stub.closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn consume_clamps_and_pauses_on_depletion() {
        let store = StateStore::open_in_memory().unwrap();
        seed_deployment(&store, "mkt-1000", MarketDeploymentStatus::Active);
        let (ledger, stub) = ledger(store.clone());
        ledger
            .create_escrow(CreateEscrow {
                market_deployment_id: "mkt-1000".to_string(),
                organization_id: "org-1".to_string(),
                price_per_unit: 1.0,
                deposit_amount: 100_000, // 100 cents at 16 cents/day ≈ 6.25 days
            })
            .unwrap();

        // Ten days far exceeds the deposit.
        let escrow = ledger
            .consume("esc-mkt-1000", Duration::from_secs(SECS_PER_DAY * 10))
            .await
            .unwrap();

        // Invariant: consumed never exceeds deposit.
        assert_eq!(escrow.consumed_cents, escrow.deposit_cents);
        assert_eq!(escrow.status, EscrowStatus::Depleted);

        // stop() is unsupported on the marketplace, so close() ran and the
        // row was re-marked Suspended for later resume.
        assert_eq!(stub.closes.load(Ordering::SeqCst), 1);
        let dep = store.get_market_deployment("mkt-1000").unwrap().unwrap();
        assert_eq!(dep.status, MarketDeploymentStatus::Suspended);
    }

    #[tokio::test]
    async fn consume_on_non_active_escrow_is_a_no_op() {
        let store = StateStore::open_in_memory().unwrap();
        seed_deployment(&store, "mkt-1000", MarketDeploymentStatus::Suspended);
        let (ledger, _) = ledger(store.clone());
        let mut escrow = ledger
            .create_escrow(CreateEscrow {
                market_deployment_id: "mkt-1000".to_string(),
                organization_id: "org-1".to_string(),
                price_per_unit: 1.0,
                deposit_amount: 100_000,
            })
            .unwrap();
        escrow.status = EscrowStatus::Depleted;
        store.put_escrow(&escrow).unwrap();

        let after = ledger
            .consume(&escrow.id, Duration::from_secs(SECS_PER_DAY))
            .await
            .unwrap();
        assert_eq!(after.consumed_cents, 0);
    }

    #[tokio::test]
    async fn topup_below_combined_burn_resumes_nothing() {
        let store = StateStore::open_in_memory().unwrap();
        seed_deployment(&store, "mkt-1000", MarketDeploymentStatus::Suspended);
        let (ledger, stub) = ledger(store.clone());
        let mut escrow = ledger
            .create_escrow(CreateEscrow {
                market_deployment_id: "mkt-1000".to_string(),
                organization_id: "org-1".to_string(),
                price_per_unit: 1.0,
                deposit_amount: 100_000,
            })
            .unwrap();
        escrow.status = EscrowStatus::Paused;
        store.put_escrow(&escrow).unwrap();

        // Daily burn is 16 cents; offer 10.
        let outcome = ledger.resume_if_funded("org-1", 10).await.unwrap();
        assert_eq!(
            outcome,
            ResumeOutcome::InsufficientBalance {
                required_cents: 16,
                available_cents: 10,
            }
        );
        assert_eq!(stub.deploys.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn topup_covering_burn_redeploys_and_refunds() {
        let store = StateStore::open_in_memory().unwrap();
        seed_deployment(&store, "mkt-1000", MarketDeploymentStatus::Suspended);
        let (ledger, stub) = ledger(store.clone());
        let mut escrow = ledger
            .create_escrow(CreateEscrow {
                market_deployment_id: "mkt-1000".to_string(),
                organization_id: "org-1".to_string(),
                price_per_unit: 1.0,
                deposit_amount: 100_000,
            })
            .unwrap();
        escrow.status = EscrowStatus::Depleted;
        store.put_escrow(&escrow).unwrap();

        let outcome = ledger.resume_if_funded("org-1", 1_000).await.unwrap();
        match outcome {
            ResumeOutcome::Resumed { deployments } => {
                assert_eq!(deployments, vec!["mkt-new-0".to_string()]);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(stub.deploys.load(Ordering::SeqCst), 1);

        let old = store.get_escrow("esc-mkt-1000").unwrap().unwrap();
        assert_eq!(old.status, EscrowStatus::Refunded);
    }

    #[tokio::test]
    async fn topup_with_nothing_paused_reports_so() {
        let store = StateStore::open_in_memory().unwrap();
        let (ledger, _) = ledger(store);
        let outcome = ledger.resume_if_funded("org-1", 1_000).await.unwrap();
        assert_eq!(outcome, ResumeOutcome::NothingPaused);
    }

    #[tokio::test]
    async fn pause_for_organization_pauses_active_escrows() {
        let store = StateStore::open_in_memory().unwrap();
        seed_deployment(&store, "mkt-1000", MarketDeploymentStatus::Active);
        let (ledger, stub) = ledger(store.clone());
        ledger
            .create_escrow(CreateEscrow {
                market_deployment_id: "mkt-1000".to_string(),
                organization_id: "org-1".to_string(),
                price_per_unit: 1.0,
                deposit_amount: 100_000,
            })
            .unwrap();

        let paused = ledger.pause_for_organization("org-1").await.unwrap();
        assert_eq!(paused, vec!["mkt-1000".to_string()]);
        assert_eq!(stub.closes.load(Ordering::SeqCst), 1);

        let escrow = store.get_escrow("esc-mkt-1000").unwrap().unwrap();
        assert_eq!(escrow.status, EscrowStatus::Paused);
    }

    #[tokio::test]
    async fn ticker_stops_on_shutdown() {
        let store = StateStore::open_in_memory().unwrap();
        let (ledger, _) = ledger(store);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            ledger.run(Duration::from_secs(3600), rx).await;
        });
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("ticker must stop promptly")
            .unwrap();
    }
}
