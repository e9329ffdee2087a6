//! flotillad — the Flotilla daemon.
//!
//! Single binary that assembles all Flotilla subsystems:
//! - State store (redb)
//! - Provider registry (marketplace + TEE backends)
//! - Escrow ledger + billing ticker
//! - URI backfill recovery
//! - Subdomain proxy server
//! - REST API server
//!
//! # Usage
//!
//! ```text
//! flotillad standalone --config flotilla.toml --api-port 8443 --proxy-port 8080
//! ```

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use flotilla_api::ApiState;
use flotilla_escrow::{CreateEscrow, EscrowConfig, EscrowLedger};
use flotilla_market::{
    CliChainClient, HttpProviderGateway, MarketOrchestrator, MarketProvider, SourceConfigCompiler,
};
use flotilla_provider::ProviderRegistry;
use flotilla_proxy::{ProxyBody, ProxyConfig, StoreResolver, SubdomainRouter};
use flotilla_state::StateStore;
use flotilla_tee::{HttpTeeClient, TeeClientConfig, TeeConfig, TeeOrchestrator, TeeProvider};

use crate::config::FlotillaConfig;

#[derive(Parser)]
#[command(name = "flotillad", about = "Flotilla daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run in standalone mode (all subsystems in one process).
    Standalone {
        /// Path to the configuration file.
        #[arg(long, default_value = "flotilla.toml")]
        config: PathBuf,

        /// Port for the REST API.
        #[arg(long, default_value = "8443")]
        api_port: u16,

        /// Port for the subdomain proxy.
        #[arg(long, default_value = "8080")]
        proxy_port: u16,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/flotilla")]
        data_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,flotillad=debug,flotilla=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Standalone {
            config,
            api_port,
            proxy_port,
            data_dir,
        } => run_standalone(config, api_port, proxy_port, data_dir).await,
    }
}

async fn run_standalone(
    config_path: PathBuf,
    api_port: u16,
    proxy_port: u16,
    data_dir: PathBuf,
) -> anyhow::Result<()> {
    info!("Flotilla daemon starting in standalone mode");

    let config = FlotillaConfig::from_file(&config_path)?;

    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("flotilla.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Marketplace backend.
    let mut registry = ProviderRegistry::new();
    let market_orchestrator = match &config.chain {
        Some(chain) => {
            let available = !chain.key_name.trim().is_empty() && !chain.node.trim().is_empty();
            let orchestrator = Arc::new(MarketOrchestrator::new(
                store.clone(),
                Arc::new(CliChainClient::new(chain.clone())),
                Arc::new(HttpProviderGateway::new().map_err(|e| anyhow::anyhow!("{e}"))?),
                Arc::new(SourceConfigCompiler),
                config.market_config(),
                shutdown_rx.clone(),
            ));
            registry.register(Arc::new(MarketProvider::new(orchestrator.clone(), available)));
            info!(available, "marketplace provider registered");
            Some(orchestrator)
        }
        None => {
            warn!("no [chain] section, marketplace backend disabled");
            None
        }
    };

    // TEE backend.
    if let Some(tee) = &config.tee {
        let api_key = std::env::var(&tee.api_key_env).unwrap_or_default();
        let client_config = TeeClientConfig {
            endpoint: tee.endpoint.clone(),
            api_key,
        };
        let available = client_config.is_configured();
        let tee_config = TeeConfig {
            hourly_rate_cents: tee
                .hourly_rate_cents
                .unwrap_or(TeeConfig::default().hourly_rate_cents),
            ..TeeConfig::default()
        };
        let orchestrator = Arc::new(TeeOrchestrator::new(
            store.clone(),
            Arc::new(HttpTeeClient::new(client_config).map_err(|e| anyhow::anyhow!("{e}"))?),
            tee_config,
            shutdown_rx.clone(),
        ));
        registry.register(Arc::new(TeeProvider::new(orchestrator, available)));
        info!(available, "tee provider registered");
    }

    let registry = Arc::new(registry);

    // Escrow ledger.
    let escrow_section = config.escrow.clone().unwrap_or_default();
    let escrow_defaults = EscrowConfig::default();
    let ledger = Arc::new(EscrowLedger::new(
        store.clone(),
        registry.clone(),
        EscrowConfig {
            margin_rate: escrow_section.margin_rate.unwrap_or(escrow_defaults.margin_rate),
            units_per_day: escrow_section
                .units_per_day
                .unwrap_or(escrow_defaults.units_per_day),
            cents_per_unit: escrow_section
                .cents_per_unit
                .unwrap_or(escrow_defaults.cents_per_unit),
            ..escrow_defaults
        },
    ));
    info!("escrow ledger initialized");

    // Deploys open escrows through the billing hook; failures are logged
    // and swallowed so a missing escrow never aborts a running deployment.
    if let Some(orchestrator) = &market_orchestrator {
        let hook_ledger = ledger.clone();
        orchestrator.set_escrow_hook(Arc::new(move |req| {
            let ledger = hook_ledger.clone();
            Box::pin(async move {
                let result = ledger.create_escrow(CreateEscrow {
                    market_deployment_id: req.market_deployment_id.clone(),
                    organization_id: req.organization_id,
                    price_per_unit: req.price_per_unit,
                    deposit_amount: req.deposit_amount,
                });
                if let Err(e) = result {
                    warn!(
                        deployment_id = %req.market_deployment_id,
                        error = %e,
                        "escrow creation failed, deployment continues without one"
                    );
                }
            })
        }));
    }

    // Re-launch backfills interrupted by a previous process exit.
    if let Some(orchestrator) = &market_orchestrator {
        orchestrator.backfill().recover_interrupted().await;
    }

    // ── Start background tasks ─────────────────────────────────

    let billing_interval = Duration::from_secs(
        config
            .escrow
            .as_ref()
            .and_then(|e| e.billing_interval_secs)
            .unwrap_or(300),
    );
    let billing_ledger = ledger.clone();
    let billing_shutdown = shutdown_rx.clone();
    let billing_handle = tokio::spawn(async move {
        billing_ledger.run(billing_interval, billing_shutdown).await;
    });

    // ── Subdomain proxy ────────────────────────────────────────

    let proxy_section = config.proxy.clone().unwrap_or_default();
    let mut proxy_config = ProxyConfig::new(config.base_domain.clone());
    if let Some(ttl) = proxy_section.cache_ttl_secs {
        proxy_config.cache_ttl = Duration::from_secs(ttl);
    }
    if let Some(capacity) = proxy_section.cache_capacity {
        proxy_config.cache_capacity = capacity;
    }
    let proxy = Arc::new(SubdomainRouter::new(
        proxy_config,
        Arc::new(StoreResolver::new(store.clone())),
    ));

    let proxy_addr = SocketAddr::from(([0, 0, 0, 0], proxy_port));
    let proxy_handle = tokio::spawn(run_proxy_server(
        proxy_addr,
        proxy.clone(),
        shutdown_rx.clone(),
    ));
    info!(%proxy_addr, "proxy server starting");

    // ── REST API ───────────────────────────────────────────────

    let router = flotilla_api::build_router(ApiState {
        store,
        registry,
        ledger,
        proxy: Some(proxy),
    });
    let api_addr = SocketAddr::from(([0, 0, 0, 0], api_port));
    info!(%api_addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(api_addr).await?;
    let mut api_shutdown = shutdown_rx.clone();
    let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
        let _ = api_shutdown.changed().await;
    });

    // ── Shutdown ───────────────────────────────────────────────

    tokio::select! {
        result = async { serve.await } => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    // Stop all outstanding background work.
    let _ = shutdown_tx.send(true);
    if let Some(orchestrator) = &market_orchestrator {
        orchestrator.backfill().stop_all().await;
    }
    let _ = billing_handle.await;
    let _ = proxy_handle.await;

    info!("Flotilla daemon stopped");
    Ok(())
}

/// Accept loop for the proxy port.
///
/// Served with upgrade support so WebSocket tunnels work end to end.
async fn run_proxy_server(
    addr: SocketAddr,
    proxy: Arc<SubdomainRouter>,
    mut shutdown: watch::Receiver<bool>,
) {
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!(%addr, error = %e, "proxy server failed to bind");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("proxy server stopping");
                return;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        debug!(error = %e, "proxy accept failed");
                        continue;
                    }
                };
                let proxy = proxy.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req| {
                        let proxy = proxy.clone();
                        async move {
                            let response = match proxy.handle(req).await {
                                Some(response) => response,
                                // Not a routable subdomain; nothing else
                                // listens on this port.
                                None => not_ours_response(),
                            };
                            Ok::<_, std::convert::Infallible>(response)
                        }
                    });
                    if let Err(e) = auto::Builder::new(TokioExecutor::new())
                        .serve_connection_with_upgrades(io, service)
                        .await
                    {
                        debug!(%peer, error = %e, "proxy connection error");
                    }
                });
            }
        }
    }
}

fn not_ours_response() -> hyper::Response<ProxyBody> {
    let body = serde_json::json!({
        "error": "not_found",
        "message": "host is not a routable subdomain",
    });
    hyper::Response::builder()
        .status(hyper::StatusCode::NOT_FOUND)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(
            Full::new(Bytes::from(body.to_string()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("static response")
}
