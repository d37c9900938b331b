//! Metric collector
//!
//! Owns the node's application set and per-application caches. Two
//! background loops run per collector: the refresh loop recomputes
//! ownership from the policy store, the drain loop moves samples from the
//! metric channel into caches and periodically flushes them to the durable
//! store.

use super::{AppRegistry, LoopHandle, RefreshSummary};
use crate::health::{components, HealthRegistry};
use crate::models::{now_nanos, AppInstanceMetric, Order, LABEL_INSTANCE_INDEX, LABEL_NAME};
use crate::observability::{MetricsServerMetrics, StructuredLogger};
use crate::store::{InstanceMetricsStore, PolicyStore, StoreError};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Configuration for the collector loops
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// How often ownership is recomputed (default: 60 seconds)
    pub refresh_interval: Duration,
    /// How often pending samples are flushed (default: 5 seconds)
    pub save_interval: Duration,
    /// Whether samples are written to the durable store
    pub persist_metrics: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(60),
            save_interval: Duration::from_secs(5),
            persist_metrics: true,
        }
    }
}

/// Collector answering metric queries from cache and durable store
pub struct MetricCollector {
    registry: Arc<AppRegistry>,
    policy_store: Arc<dyn PolicyStore>,
    metrics_store: Arc<dyn InstanceMetricsStore>,
    config: CollectorConfig,
    health: HealthRegistry,
    metrics: MetricsServerMetrics,
    logger: StructuredLogger,
}

impl MetricCollector {
    pub fn new(
        registry: Arc<AppRegistry>,
        policy_store: Arc<dyn PolicyStore>,
        metrics_store: Arc<dyn InstanceMetricsStore>,
        config: CollectorConfig,
        health: HealthRegistry,
    ) -> Self {
        let logger = StructuredLogger::new(registry.node_index());
        Self {
            registry,
            policy_store,
            metrics_store,
            config,
            health,
            metrics: MetricsServerMetrics::new(),
            logger,
        }
    }

    /// Spawn the refresh and drain loops.
    ///
    /// The returned handle stops both loops.
    pub fn start(self: &Arc<Self>, metrics_rx: mpsc::Receiver<AppInstanceMetric>) -> LoopHandle {
        let (shutdown_tx, _) = broadcast::channel(1);

        let refresh = tokio::spawn(Arc::clone(self).run_refresh_loop(shutdown_tx.subscribe()));
        let drain = tokio::spawn(
            Arc::clone(self).run_drain_loop(metrics_rx, shutdown_tx.subscribe()),
        );

        info!(
            refresh_interval_secs = self.config.refresh_interval.as_secs_f64(),
            save_interval_secs = self.config.save_interval.as_secs_f64(),
            persist_metrics = self.config.persist_metrics,
            "Metric collector started"
        );

        LoopHandle::new(shutdown_tx, vec![refresh, drain])
    }

    /// Registry of owned applications
    pub fn registry(&self) -> &Arc<AppRegistry> {
        &self.registry
    }

    /// Snapshot of the applications owned by this node
    pub fn get_app_ids(&self) -> HashSet<String> {
        self.registry.app_ids()
    }

    /// Fetch the application list and recompute ownership.
    ///
    /// On error the previous application set is left untouched.
    pub async fn refresh_apps(&self) -> Result<RefreshSummary, StoreError> {
        match self.policy_store.get_app_ids().await {
            Ok(all_app_ids) => {
                let summary = self.registry.replace(&all_app_ids);
                self.metrics.set_owned_apps(summary.owned);
                self.logger
                    .log_apps_refreshed(summary.owned, summary.added, summary.removed);
                self.health.set_healthy(components::POLICY_STORE).await;
                Ok(summary)
            }
            Err(e) => {
                self.logger.log_refresh_failed(&e.to_string());
                self.metrics.inc_refresh_errors();
                self.health
                    .set_degraded(components::POLICY_STORE, e.to_string())
                    .await;
                Err(e)
            }
        }
    }

    async fn run_refresh_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        // First tick completes immediately
        let mut ticker = interval(self.config.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutting down application refresh loop");
                    break;
                }
                _ = ticker.tick() => {
                    if self.refresh_apps().await.is_err() {
                        debug!("Keeping previous application set");
                    }
                }
            }
        }
    }

    async fn run_drain_loop(
        self: Arc<Self>,
        mut metrics_rx: mpsc::Receiver<AppInstanceMetric>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let save_interval = self.config.save_interval;
        let mut ticker = interval_at(Instant::now() + save_interval, save_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut batch: Vec<AppInstanceMetric> = Vec::new();

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(pending = batch.len(), "Shutting down metric drain loop");
                    break;
                }
                maybe_metric = metrics_rx.recv() => {
                    match maybe_metric {
                        Some(metric) => {
                            if self.config.persist_metrics {
                                batch.push(metric.clone());
                            }
                            self.registry.put(metric);
                        }
                        None => {
                            warn!(pending = batch.len(), "Metric channel closed, stopping drain loop");
                            self.health
                                .set_unhealthy(components::COLLECTOR, "metric channel closed")
                                .await;
                            if self.config.persist_metrics && !batch.is_empty() {
                                self.flush(std::mem::take(&mut batch)).await;
                            }
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if self.config.persist_metrics && !batch.is_empty() {
                        let pending = std::mem::take(&mut batch);
                        let this = Arc::clone(&self);
                        tokio::spawn(async move { this.flush(pending).await });
                    }
                }
            }
        }
    }

    /// Write one batch to the durable store. Failed batches are dropped.
    async fn flush(&self, batch: Vec<AppInstanceMetric>) {
        let count = batch.len();
        match self.metrics_store.save_metrics_in_bulk(batch).await {
            Ok(()) => {
                self.logger.log_metrics_flushed(count, None);
                self.health.set_healthy(components::METRICS_STORE).await;
            }
            Err(e) => {
                let message = e.to_string();
                self.logger.log_metrics_flushed(count, Some(&message));
                self.metrics.inc_flush_errors();
                self.health
                    .set_degraded(components::METRICS_STORE, message)
                    .await;
            }
        }
    }

    /// Samples of `name` for `app_id` with `start <= timestamp <= end`.
    ///
    /// `end == -1` means now and a negative `instance_index` selects every
    /// instance. The cache answers when it covers the range or when there
    /// is no durable store to fall back on.
    pub async fn query_metrics(
        &self,
        app_id: &str,
        instance_index: i32,
        name: &str,
        start: i64,
        end: i64,
        order: Order,
    ) -> Result<Vec<AppInstanceMetric>, StoreError> {
        let end = resolve_end(end);

        let mut labels = HashMap::new();
        labels.insert(LABEL_NAME.to_string(), name.to_string());
        if instance_index >= 0 {
            labels.insert(LABEL_INSTANCE_INDEX.to_string(), instance_index.to_string());
        }

        if let Some(samples) = self.query_cache(app_id, start, end, order, &labels) {
            return Ok(samples);
        }

        if !self.config.persist_metrics {
            return Ok(Vec::new());
        }

        self.metrics_store
            .retrieve_instance_metrics(app_id, instance_index, name, start, end, order)
            .await
    }

    /// Cache-only query with arbitrary labels.
    ///
    /// Returns `None` when the cache cannot answer authoritatively and the
    /// caller has to consult the durable store.
    pub fn query_metrics_with_labels(
        &self,
        app_id: &str,
        start: i64,
        end: i64,
        order: Order,
        labels: &HashMap<String, String>,
    ) -> Option<Vec<AppInstanceMetric>> {
        let end = resolve_end(end);
        match self.query_cache(app_id, start, end, order, labels) {
            Some(samples) => Some(samples),
            None if !self.config.persist_metrics => Some(Vec::new()),
            None => None,
        }
    }

    fn query_cache(
        &self,
        app_id: &str,
        start: i64,
        end: i64,
        order: Order,
        labels: &HashMap<String, String>,
    ) -> Option<Vec<AppInstanceMetric>> {
        let cache = self.registry.cache(app_id)?;

        // Cache ranges are half-open
        let result = cache.query(start, end.saturating_add(1), labels);
        if !result.fully_covered && self.config.persist_metrics {
            self.metrics.inc_cache_misses();
            return None;
        }

        self.metrics.inc_cache_hits();
        let mut samples = result.samples;
        if order == Order::Desc {
            samples.reverse();
        }
        Some(samples)
    }
}

fn resolve_end(end: i64) -> i64 {
    if end == -1 {
        now_nanos()
    } else {
        end
    }
}
