//! rstflow - Durable Workflow Engine
//!
//! Loads workflow definitions, opens the journaled store and runs the
//! timeout sweeper and metrics endpoint until Ctrl-C.

use rstflow_core::Registry;
use rstflow_engine::{
    loader, run_metrics_server, Broadcaster, Config, Metrics, TimeoutSweeper, WorkflowManager,
};
use rstflow_store::MemoryStore;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if RSTFLOW_CONFIG is set, then env overrides)
    let config_path = std::env::var("RSTFLOW_CONFIG").ok();
    let config = match Config::load() {
        Ok(c) => {
            if let Some(path) = &config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };

    tracing::info!("Starting rstflow");
    tracing::info!("  Data directory: {}", config.storage.data_dir.display());

    // Open store
    let store_config = config.storage.store_config();
    if let Some(journal) = &store_config.journal_path {
        std::fs::create_dir_all(&config.storage.data_dir)?;
        tracing::info!(
            "  Journal: {} (fsync {:?})",
            journal.display(),
            store_config.fsync_policy
        );
    } else {
        tracing::info!("  Journal: disabled, state is not durable");
    }
    let store = MemoryStore::open(store_config)?;

    // Register workflow types
    let registry = Arc::new(Registry::new());
    let registered = loader::register_all(&registry, &config.engine.definitions_dir)?;
    tracing::info!(
        "  Workflow types: {} from {}",
        registered,
        config.engine.definitions_dir.display()
    );

    let metrics = if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        metrics.registered_types.set(registry.len() as f64);
        Some(metrics)
    } else {
        None
    };

    let broadcaster = Arc::new(Broadcaster::default());
    let mut manager = WorkflowManager::new(registry, Arc::new(store))
        .with_sink(broadcaster)
        .with_max_depth(config.engine.max_transition_depth);
    if let Some(metrics) = &metrics {
        manager = manager.with_metrics(metrics.clone());
    }
    let manager = Arc::new(manager);

    // Spawn timeout sweeper
    let mut sweeper = TimeoutSweeper::new(manager, config.sweeper.clone());
    if let Some(metrics) = &metrics {
        sweeper = sweeper.with_metrics(metrics.clone());
    }
    let sweeper = Arc::new(sweeper);
    let sweeper_handle = {
        let sweeper = sweeper.clone();
        tokio::spawn(async move {
            sweeper.run().await;
        })
    };

    // Spawn metrics server
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let metrics_handle = metrics.map(|metrics| {
        let addr = config.metrics.bind_addr;
        let shutdown_rx = shutdown_tx.subscribe();
        tracing::info!("  Metrics: enabled on {}", addr);
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, shutdown_rx).await {
                tracing::error!("Metrics server error: {}", e);
            }
        })
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping...");
    sweeper.shutdown();
    let _ = shutdown_tx.send(());

    let _ = sweeper_handle.await;
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    tracing::info!("rstflow stopped");
    Ok(())
}
