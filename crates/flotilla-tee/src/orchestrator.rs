//! TEE deployment lifecycle.
//!
//! Create an app from a compose manifest, poll until the remote reports it
//! running, and persist the row. Stop/start flip the remote app and the row
//! in lockstep; close deletes the remote app for good.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use flotilla_provider::{DeployOptions, DeploymentResult};
use flotilla_state::{Service, ServiceStatus, StateStore, TeeDeployment, TeeDeploymentStatus};

use crate::client::TeeControlApi;
use crate::error::{TeeError, TeeResult};

/// Tuning for the TEE deploy flow.
#[derive(Debug, Clone)]
pub struct TeeConfig {
    pub ready_poll_interval: Duration,
    pub ready_poll_attempts: u32,
    /// Hourly rate recorded on new deployments.
    pub hourly_rate_cents: u64,
}

impl Default for TeeConfig {
    fn default() -> Self {
        Self {
            ready_poll_interval: Duration::from_secs(5),
            ready_poll_attempts: 60,
            hourly_rate_cents: 12,
        }
    }
}

/// Drives deployments on the confidential-computing backend.
pub struct TeeOrchestrator {
    store: StateStore,
    api: Arc<dyn TeeControlApi>,
    config: TeeConfig,
    shutdown: watch::Receiver<bool>,
}

impl TeeOrchestrator {
    pub fn new(
        store: StateStore,
        api: Arc<dyn TeeControlApi>,
        config: TeeConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            api,
            config,
            shutdown,
        }
    }

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
    ) -> TeeResult<()> {
        let mut service = self
            .store
            .get_service(service_id)?
            .ok_or_else(|| TeeError::ServiceNotFound(service_id.to_string()))?;
        service.status = status;
        if invoke_url.is_some() {
            service.invoke_url = invoke_url;
        }
        service.updated_at = epoch_secs();
        self.store.put_service(&service)?;
        Ok(())
    }

    /// Deploy a service onto the TEE backend.
    ///
    /// Any existing live deployment for the service is deleted remotely and
    /// superseded first.
    pub async fn deploy(
        &self,
        service_id: &str,
        options: DeployOptions,
    ) -> TeeResult<DeploymentResult> {
        let service = self
            .store
            .get_service(service_id)?
            .ok_or_else(|| TeeError::ServiceNotFound(service_id.to_string()))?;

        let compose = options
            .manifest
            .unwrap_or_else(|| service.source_config.clone());

        if let Some(stale) = self.store.active_tee_deployment(service_id)? {
            self.supersede(stale).await;
        }

        self.update_service(service_id, ServiceStatus::Deploying, None)?;

        match self.run_create(&service, &compose).await {
            Ok(dep) => {
                self.update_service(service_id, ServiceStatus::Active, dep.app_url.clone())?;
                info!(
                    service_id,
                    deployment_id = %dep.id,
                    app_id = %dep.app_id,
                    "tee deployment active"
                );
                Ok(DeploymentResult {
                    deployment_id: dep.id.clone(),
                    service_urls: dep
                        .app_url
                        .as_ref()
                        .map(|url| {
                            let mut map = std::collections::BTreeMap::new();
                            map.insert("app".to_string(), vec![url.clone()]);
                            map
                        })
                        .unwrap_or_default(),
                    invoke_url: dep.app_url,
                })
            }
            Err(err) => {
                let _ = self.update_service(service_id, ServiceStatus::Failed, None);
                Err(err)
            }
        }
    }

    async fn run_create(&self, service: &Service, compose: &str) -> TeeResult<TeeDeployment> {
        let app = self.api.create_app(&service.slug, compose).await?;

        let mut dep = TeeDeployment {
            id: format!("tee-{}", app.app_id),
            service_id: service.id.clone(),
            app_id: app.app_id.clone(),
            status: TeeDeploymentStatus::Creating,
            app_url: app.app_url.clone(),
            hourly_rate_cents: self.config.hourly_rate_cents,
            total_billed_cents: 0,
            last_billed_at: None,
            created_at: epoch_secs(),
            updated_at: epoch_secs(),
        };
        self.store.put_tee_deployment(&dep)?;

        match self.wait_until_running(&mut dep).await {
            Ok(()) => Ok(dep),
            Err(err) => {
                dep.status = TeeDeploymentStatus::Failed;
                dep.updated_at = epoch_secs();
                self.store.put_tee_deployment(&dep)?;
                warn!(deployment_id = %dep.id, error = %err, "tee deployment failed");
                Err(err)
            }
        }
    }

    async fn wait_until_running(&self, dep: &mut TeeDeployment) -> TeeResult<()> {
        for attempt in 0..self.config.ready_poll_attempts {
            match self.api.app_status(&dep.app_id).await {
                Ok(state) if state.status == "running" => {
                    dep.status = TeeDeploymentStatus::Active;
                    dep.app_url = state.app_url.or(dep.app_url.take());
                    dep.updated_at = epoch_secs();
                    self.store.put_tee_deployment(dep)?;
                    return Ok(());
                }
                Ok(state) => {
                    debug!(
                        deployment_id = %dep.id,
                        attempt,
                        native = %state.status,
                        "tee app not running yet"
                    );
                    if dep.status != TeeDeploymentStatus::Starting {
                        dep.status = TeeDeploymentStatus::Starting;
                        dep.updated_at = epoch_secs();
                        self.store.put_tee_deployment(dep)?;
                    }
                }
                Err(e) => {
                    debug!(deployment_id = %dep.id, attempt, error = %e, "tee status poll failed");
                }
            }
            if self.sleep_cancellable(self.config.ready_poll_interval).await {
                return Err(TeeError::Cancelled);
            }
        }
        Err(TeeError::NeverReady {
            attempts: self.config.ready_poll_attempts,
        })
    }

    /// Best-effort delete of a superseded deployment.
    async fn supersede(&self, mut dep: TeeDeployment) {
        if let Err(e) = self.api.delete_app(&dep.app_id).await {
            warn!(deployment_id = %dep.id, error = %e, "failed to delete superseded tee app");
        }
        dep.status = TeeDeploymentStatus::Deleted;
        dep.updated_at = epoch_secs();
        if let Err(e) = self.store.put_tee_deployment(&dep) {
            warn!(deployment_id = %dep.id, error = %e, "failed to mark superseded row deleted");
        }
    }

    /// Pause a running deployment (reversible).
    pub async fn stop(&self, deployment_id: &str) -> TeeResult<()> {
        let mut dep = self.get(deployment_id)?;
        if dep.status == TeeDeploymentStatus::Stopped {
            return Ok(());
        }
        self.api.stop_app(&dep.app_id).await?;
        dep.status = TeeDeploymentStatus::Stopped;
        dep.updated_at = epoch_secs();
        self.store.put_tee_deployment(&dep)?;
        info!(deployment_id, "tee deployment stopped");
        Ok(())
    }

    /// Resume a stopped deployment in place.
    pub async fn start(&self, deployment_id: &str) -> TeeResult<()> {
        let mut dep = self.get(deployment_id)?;
        if dep.status == TeeDeploymentStatus::Active {
            return Ok(());
        }
        self.api.start_app(&dep.app_id).await?;
        dep.status = TeeDeploymentStatus::Active;
        dep.updated_at = epoch_secs();
        self.store.put_tee_deployment(&dep)?;
        self.update_service(&dep.service_id, ServiceStatus::Active, None)?;
        info!(deployment_id, "tee deployment started");
        Ok(())
    }

    /// Delete the remote app and mark the row. Idempotent.
    pub async fn close(&self, deployment_id: &str) -> TeeResult<()> {
        let mut dep = self.get(deployment_id)?;
        if dep.status == TeeDeploymentStatus::Deleted {
            return Ok(());
        }
        self.api.delete_app(&dep.app_id).await?;
        dep.status = TeeDeploymentStatus::Deleted;
        dep.updated_at = epoch_secs();
        self.store.put_tee_deployment(&dep)?;
        info!(deployment_id, "tee deployment deleted");
        Ok(())
    }

    pub fn get(&self, deployment_id: &str) -> TeeResult<TeeDeployment> {
        self.store
            .get_tee_deployment(deployment_id)?
            .ok_or_else(|| TeeError::DeploymentNotFound(deployment_id.to_string()))
    }

    /// Live status from the remote API, with the row as fallback shape.
    pub async fn remote_status(&self, deployment_id: &str) -> TeeResult<(TeeDeployment, String)> {
        let dep = self.get(deployment_id)?;
        match self.api.app_status(&dep.app_id).await {
            Ok(state) => Ok((dep, state.status)),
            // Deleted rows have nothing remote to ask.
            Err(_) if dep.status == TeeDeploymentStatus::Deleted => {
                Ok((dep, "terminated".to_string()))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn logs(&self, deployment_id: &str, tail: Option<u32>) -> TeeResult<String> {
        let dep = self.get(deployment_id)?;
        self.api.app_logs(&dep.app_id, tail).await
    }
}

fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
