//! Periodic retention pruning of the durable metrics store

use super::InstanceMetricsStore;
use crate::collector::LoopHandle;
use crate::models::now_nanos;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info};

/// Removes samples older than the retention window on a fixed interval
pub struct MetricsPruner {
    store: Arc<dyn InstanceMetricsStore>,
    retention: Duration,
    interval: Duration,
}

impl MetricsPruner {
    pub fn new(
        store: Arc<dyn InstanceMetricsStore>,
        retention: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            retention,
            interval,
        }
    }

    pub fn start(self) -> LoopHandle {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(self.run(shutdown_rx));
        LoopHandle::new(shutdown_tx, vec![task])
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutting down metrics pruner");
                    break;
                }
                _ = ticker.tick() => self.prune_once().await,
            }
        }
    }

    /// Prune everything older than `now - retention`
    pub async fn prune_once(&self) {
        let retention_nanos = i64::try_from(self.retention.as_nanos()).unwrap_or(i64::MAX);
        let cutoff = now_nanos().saturating_sub(retention_nanos);

        match self.store.prune_instance_metrics(cutoff).await {
            Ok(removed) => info!(removed = removed, cutoff = cutoff, "Pruned instance metrics"),
            Err(e) => error!(error = %e, "Failed to prune instance metrics"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AppInstanceMetric, METRIC_NAME_THROUGHPUT, UNIT_RPS};
    use crate::store::MemoryInstanceMetricsStore;

    fn metric(timestamp: i64) -> AppInstanceMetric {
        AppInstanceMetric {
            app_id: "app".to_string(),
            instance_index: 0,
            collected_at: timestamp,
            name: METRIC_NAME_THROUGHPUT.to_string(),
            unit: UNIT_RPS.to_string(),
            value: "1".to_string(),
            timestamp,
        }
    }

    #[tokio::test]
    async fn test_prune_once_respects_retention() {
        let store = Arc::new(MemoryInstanceMetricsStore::new());
        let now = now_nanos();
        let hour = 3_600_000_000_000i64;
        store
            .save_metrics_in_bulk(vec![metric(now - 3 * hour), metric(now - hour / 2)])
            .await
            .unwrap();

        let pruner = MetricsPruner::new(
            store.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(60),
        );
        pruner.prune_once().await;

        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pruner_loop_stops() {
        let store = Arc::new(MemoryInstanceMetricsStore::new());
        let handle =
            MetricsPruner::new(store, Duration::from_secs(3600), Duration::from_secs(60)).start();

        tokio::time::sleep(Duration::from_secs(61)).await;
        handle.stop().await;
    }
}
