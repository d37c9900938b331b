//! Metrics server - autoscaler metric ingestion and history service
//!
//! Ingests application telemetry envelopes over WebSocket, keeps a bounded
//! per-application cache for the applications this node owns, persists
//! samples and answers metric history queries.

use anyhow::{Context, Result};
use clap::Parser;
use metricsserver::{api, config::Config};
use metricsserver_lib::{
    collector::{AppRegistry, CollectorConfig, EnvelopeProcessor, LoopHandle, MetricCollector},
    health::{components, HealthRegistry},
    observability::{MetricsServerMetrics, StructuredLogger},
    server::{ingestion_router, query_router, IngestionState, QueryState},
    store::{
        FilePolicyStore, InstanceMetricsStore, MemoryInstanceMetricsStore, MemoryStoreConfig,
        MetricsPruner, PolicyStore, StaticPolicyStore,
    },
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "metricsserver")]
#[command(version, about = "Autoscaler metrics server", long_about = None)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "METRICSSERVER_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .with(fmt::layer().json())
        .init();

    let logger = StructuredLogger::new(config.server.node_index);
    logger.log_startup(VERSION, &config.server.node_addrs);

    // Initialize health registry
    let health_registry = HealthRegistry::new();
    for component in components::ALL {
        health_registry.register(component).await;
    }
    let metrics = MetricsServerMetrics::new();

    // Stores
    let policy_store: Arc<dyn PolicyStore> = match &config.policy_store.app_ids_file {
        Some(path) => {
            info!(path = %path.display(), "Reading application ids from file");
            Arc::new(FilePolicyStore::new(path))
        }
        None => Arc::new(StaticPolicyStore::new(config.policy_store.app_ids.clone())),
    };
    let metrics_store: Arc<dyn InstanceMetricsStore> =
        Arc::new(MemoryInstanceMetricsStore::with_config(MemoryStoreConfig {
            snapshot_path: config.metrics_store.snapshot_path.clone(),
        }));

    // Collector
    let collector_cfg = &config.collector;
    let (metric_tx, metric_rx) = mpsc::channel(collector_cfg.metric_channel_size);
    let registry = Arc::new(AppRegistry::new(
        config.server.node_index,
        config.server.node_addrs.len(),
        collector_cfg.metric_cache_size_per_app,
    ));
    let collector = Arc::new(MetricCollector::new(
        registry.clone(),
        policy_store,
        metrics_store.clone(),
        CollectorConfig {
            refresh_interval: collector_cfg.refresh_interval,
            save_interval: collector_cfg.save_interval,
            persist_metrics: collector_cfg.persist_metrics,
        },
        health_registry.clone(),
    ));
    let collector_handle = collector.start(metric_rx);

    // Envelope processors, one input queue each
    let worker_count = collector_cfg.envelope_processor_count;
    let mut envelope_channels = Vec::with_capacity(worker_count);
    let mut processor_handles = Vec::with_capacity(worker_count);
    for index in 0..worker_count {
        let (envelope_tx, envelope_rx) = mpsc::channel(collector_cfg.envelope_channel_size);
        envelope_channels.push(envelope_tx);
        let processor = EnvelopeProcessor::new(
            index,
            worker_count,
            collector_cfg.collect_interval,
            envelope_rx,
            metric_tx.clone(),
            registry.clone(),
        )
        .with_health(health_registry.clone());
        processor_handles.push(processor.start());
    }
    drop(metric_tx);

    let pruner_handle = MetricsPruner::new(
        metrics_store,
        config.metrics_store.retention,
        config.metrics_store.prune_interval,
    )
    .start();

    // HTTP servers
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let ingestion_state = Arc::new(IngestionState::new(
        envelope_channels,
        collector_cfg.ws_keep_alive_time,
        logger.clone(),
    ));
    let query_state = Arc::new(QueryState::new(
        config.server.node_index,
        config.node_query_addrs(),
        config.server.redirect_scheme.clone(),
        collector.clone(),
    ));
    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics));

    let servers: Vec<JoinHandle<Result<()>>> = vec![
        tokio::spawn(api::report_failure(
            health_registry.clone(),
            components::INGESTION,
            api::serve(
                "ingestion",
                collector_cfg.ws_port,
                ingestion_router(ingestion_state),
                wait_for(shutdown_tx.subscribe()),
            ),
        )),
        tokio::spawn(api::serve(
            "query",
            config.server.port,
            query_router(query_state),
            wait_for(shutdown_tx.subscribe()),
        )),
        tokio::spawn(api::serve(
            "health",
            config.health.port,
            api::create_router(app_state),
            wait_for(shutdown_tx.subscribe()),
        )),
    ];

    // Mark server as ready after initialization
    health_registry.set_ready(true).await;

    let reason = shutdown_signal().await?;
    logger.log_shutdown(reason);
    health_registry.set_ready(false).await;

    let _ = shutdown_tx.send(());
    for server in servers {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "HTTP server failed"),
            Err(e) => error!(error = %e, "HTTP server task panicked"),
        }
    }

    stop_all(processor_handles).await;
    collector_handle.stop().await;
    pruner_handle.stop().await;

    info!("Shutdown complete");
    Ok(())
}

async fn wait_for(mut shutdown: broadcast::Receiver<()>) {
    let _ = shutdown.recv().await;
}

async fn stop_all(handles: Vec<LoopHandle>) {
    for handle in handles {
        handle.stop().await;
    }
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() -> Result<&'static str> {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("Failed to install SIGTERM handler")?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for SIGINT")?;
                Ok("SIGINT received")
            }
            _ = sigterm.recv() => Ok("SIGTERM received"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for SIGINT")?;
        Ok("SIGINT received")
    }
}
