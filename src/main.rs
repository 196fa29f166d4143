//! Fusion Resolver - cross-chain hashlock/timelock swap execution
//!
//! This resolver watches order sources on every configured chain, prices and
//! scores new swap intents, and executes the profitable ones through paired
//! source and destination escrows.

use anyhow::Result;
use std::sync::Arc;
use std::time::Instant;
use tokio::signal;
use tokio::sync::{broadcast, RwLock};
use tracing::{error, info, warn};

mod api;
mod chain;
mod config;
mod coordination;
mod error;
mod escrow;
mod events;
mod metrics;
mod monitor;
mod pricing;
mod state;
mod tx;
mod types;

use api::AppState;
use chain::ChainManager;
use config::Settings;
use coordination::{CoordinationEngine, SecretStore};
use metrics::MetricsServer;
use monitor::{MonitorConfig, OrderMonitor};
use pricing::QuoteEngine;
use state::{MemoryStore, PgStore, StateStore};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Fusion Resolver v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains (instance {})",
        settings.enabled_chains().len(),
        settings.resolver.instance_id
    );

    // Initialize persistence
    let store: Arc<dyn StateStore> = match &settings.database {
        Some(database) => {
            let store = PgStore::connect(database).await?;
            info!("Database connection established");
            Arc::new(store)
        }
        None => {
            warn!("No database configured, order state is kept in memory");
            Arc::new(MemoryStore::new())
        }
    };

    // Initialize chain manager (handles all chain connections)
    let chains = Arc::new(ChainManager::from_settings(&settings).await?);
    info!("Chain connections initialized");

    let quotes = Arc::new(QuoteEngine::new(&settings.pricing)?);
    let secrets = Arc::new(SecretStore::new());
    let shutdown = Arc::new(RwLock::new(false));
    let (event_tx, event_rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

    // Initialize coordination engine
    let engine = Arc::new(CoordinationEngine::new(
        chains.clone(),
        store.clone(),
        secrets,
        quotes.clone(),
        &settings,
        shutdown.clone(),
    ));
    engine.recover().await?;
    info!("Coordination engine initialized");

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let state = AppState {
            chains: chains.clone(),
            store: store.clone(),
            quotes,
            engine: engine.clone(),
            timelocks: settings.timelocks,
            started_at: Instant::now(),
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

    // Start one monitor per chain
    let monitor_config = MonitorConfig::from(&settings.resolver);
    let mut monitor_handles = Vec::new();
    for chain_id in chains.connected_chains() {
        let monitor = Arc::new(OrderMonitor::new(
            chains.get(chain_id)?,
            store.clone(),
            event_tx.clone(),
            monitor_config.clone(),
        ));
        monitor_handles.push(tokio::spawn(monitor.run(shutdown.clone())));
    }

    // Start coordination engine
    let coordination_handle = tokio::spawn(engine.clone().run(event_rx));

    // Health check loop
    let health_handle = tokio::spawn({
        let chains = chains.clone();
        let store = store.clone();
        let interval = settings.resolver.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;

                let mut healthy = true;
                for (chain_id, chain_ok) in chains.health_check().await {
                    if !chain_ok {
                        warn!("Chain {} health check failed", chain_id);
                        healthy = false;
                    }
                }

                if let Err(e) = store.health_check().await {
                    warn!("{} store health check failed: {}", store.backend(), e);
                    healthy = false;
                }

                if healthy {
                    metrics::record_health_check();
                } else {
                    metrics::record_health_check_failure();
                }
            }
        }
    });

    info!("Fusion Resolver is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown: monitors stop polling, the engine drains executions
    *shutdown.write().await = true;
    for handle in monitor_handles {
        if let Err(e) = handle.await {
            error!("Monitor task failed: {}", e);
        }
    }
    if let Err(e) = coordination_handle.await {
        error!("Coordination task failed: {}", e);
    }

    // Abort background tasks
    api_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Fusion Resolver stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,fusion_resolver=debug,sqlx=warn,hyper=warn")
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
