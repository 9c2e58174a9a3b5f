//! MicroLoan coordinator - drives collateralised lending workflows
//!
//! Each user request becomes a task that moves through a fixed sequence of
//! ledger operations. The coordinator submits one operation at a time, waits
//! for it to settle, and records progress durably so a restart resumes where
//! it stopped instead of submitting twice.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tokio::time::{timeout, Duration};
use tracing::{error, info, warn};

mod api;
mod config;
mod coordination;
mod error;
mod ledger;
mod metrics;
mod settlement;
mod state;
mod task;

use config::Settings;
use coordination::{Orchestrator, TaskDriver};
use ledger::{ChainBackend, LedgerFacade, RpcProvider};
use metrics::MetricsServer;
use settlement::{ChainSettlement, SettlementPoller};
use state::{MemoryTaskStore, PgTaskStore, TaskStore};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting MicroLoan coordinator v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load()?;
    info!(
        "Loaded configuration for instance {} on {}",
        settings.coordinator.instance_id, settings.chain.name
    );

    // Task store
    let store: Arc<dyn TaskStore> = if settings.database.is_memory() {
        warn!("Using in-memory task store; progress will not survive a restart");
        Arc::new(MemoryTaskStore::new())
    } else {
        let pg = PgTaskStore::new(&settings.database).await?;
        info!("Database connection established");
        pg.run_migrations().await?;
        info!("Database migrations complete");
        Arc::new(pg)
    };

    // Ledger and settlement
    let provider = Arc::new(RpcProvider::new(&settings.chain)?);
    let backend = ChainBackend::new(provider.clone(), &settings.chain, &settings.wallet)?;
    let ledger = Arc::new(LedgerFacade::new(Arc::new(backend)));
    let source = ChainSettlement::new(provider.clone(), settings.chain.confirmation_blocks);
    let poller = Arc::new(SettlementPoller::new(Arc::new(source), &settings.settlement));
    info!("Ledger connection initialized for chain {}", provider.chain_id());

    // Orchestration
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        ledger.clone(),
        poller,
        settings.settlement.timeout(),
    ));
    let driver = Arc::new(TaskDriver::new(
        orchestrator,
        store.clone(),
        settings.coordinator.clone(),
    ));

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let state = api::AppState {
            store: store.clone(),
            ledger: ledger.clone(),
            driver: driver.clone(),
        };
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Start task driver; its first scan resumes tasks left mid-step
    let mut driver_handle = tokio::spawn({
        let driver = driver.clone();
        async move {
            if let Err(e) = driver.run().await {
                error!("Task driver error: {}", e);
            }
        }
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let store = store.clone();
        let ledger = ledger.clone();
        let interval = settings.coordinator.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(Duration::from_secs(interval)).await;

                let ledger_ok = ledger.health_check().await;
                if !ledger_ok {
                    warn!("Ledger health check failed");
                }
                metrics::record_component_health("ledger", ledger_ok);

                let store_ok = match store.health_check().await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("Task store health check failed: {}", e);
                        false
                    }
                };
                metrics::record_component_health("store", store_ok);

                if ledger_ok && store_ok {
                    metrics::record_health_check();
                } else {
                    metrics::record_health_check_failure();
                }
            }
        }
    });

    info!("MicroLoan coordinator is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // In-flight waits are interrupted; their tasks keep their recorded handles
    driver.stop();
    if timeout(Duration::from_secs(10), &mut driver_handle).await.is_err() {
        warn!("Task driver did not stop in time");
        driver_handle.abort();
    }

    api_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("MicroLoan coordinator stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,microloan_coordinator=debug,sqlx=warn,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
