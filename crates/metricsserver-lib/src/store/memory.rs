//! In-process instance metrics store
//!
//! Keeps every saved sample in memory, grouped per application and ordered
//! by timestamp. When a snapshot path is configured the whole store is
//! written to disk after every mutation (temp file + rename) and reloaded on
//! startup.

use super::{InstanceMetricsStore, StoreError};
use crate::models::{AppInstanceMetric, Order};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, info, warn};

/// Configuration for the in-process store
#[derive(Debug, Clone, Default)]
pub struct MemoryStoreConfig {
    /// JSON snapshot location (optional)
    pub snapshot_path: Option<PathBuf>,
}

/// Instance metrics kept in memory, optionally snapshotted to disk
pub struct MemoryInstanceMetricsStore {
    metrics: RwLock<HashMap<String, Vec<AppInstanceMetric>>>,
    config: MemoryStoreConfig,
}

impl MemoryInstanceMetricsStore {
    /// Create an empty store without persistence
    pub fn new() -> Self {
        Self::with_config(MemoryStoreConfig::default())
    }

    /// Create a store, loading an existing snapshot if one is present
    pub fn with_config(config: MemoryStoreConfig) -> Self {
        let store = Self {
            metrics: RwLock::new(HashMap::new()),
            config,
        };

        if let Some(path) = store.config.snapshot_path.as_ref() {
            if path.exists() {
                if let Err(e) = store.load_snapshot(path) {
                    warn!(error = %e, path = %path.display(), "Failed to load metrics snapshot, starting fresh");
                }
            }
        }

        store
    }

    /// Total number of stored samples
    pub fn len(&self) -> usize {
        self.metrics
            .read()
            .map(|m| m.values().map(Vec::len).sum())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn load_snapshot(&self, path: &Path) -> Result<(), StoreError> {
        let data = std::fs::read(path)?;
        let metrics: Vec<AppInstanceMetric> = serde_json::from_slice(&data)?;
        let count = metrics.len();

        let mut guard = self.metrics.write().map_err(|_| StoreError::Poisoned)?;
        for m in metrics {
            insert_sorted(guard.entry(m.app_id.clone()).or_default(), m);
        }

        info!(path = %path.display(), entries = count, "Loaded metrics snapshot");
        Ok(())
    }

    fn write_snapshot(&self) -> Result<(), StoreError> {
        let Some(path) = self.config.snapshot_path.as_ref() else {
            return Ok(());
        };

        let json = {
            let guard = self.metrics.read().map_err(|_| StoreError::Poisoned)?;
            let all: Vec<&AppInstanceMetric> = guard.values().flatten().collect();
            serde_json::to_vec(&all)?
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let temp_path = path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;
        std::fs::rename(&temp_path, path)?;

        debug!(path = %path.display(), bytes = json.len(), "Metrics snapshot written");
        Ok(())
    }
}

impl Default for MemoryInstanceMetricsStore {
    fn default() -> Self {
        Self::new()
    }
}

fn insert_sorted(series: &mut Vec<AppInstanceMetric>, metric: AppInstanceMetric) {
    let pos = series.partition_point(|m| m.timestamp <= metric.timestamp);
    series.insert(pos, metric);
}

#[async_trait]
impl InstanceMetricsStore for MemoryInstanceMetricsStore {
    async fn save_metrics_in_bulk(
        &self,
        metrics: Vec<AppInstanceMetric>,
    ) -> Result<(), StoreError> {
        {
            let mut guard = self.metrics.write().map_err(|_| StoreError::Poisoned)?;
            for m in metrics {
                insert_sorted(guard.entry(m.app_id.clone()).or_default(), m);
            }
        }
        self.write_snapshot()
    }

    async fn retrieve_instance_metrics(
        &self,
        app_id: &str,
        instance_index: i32,
        name: &str,
        start: i64,
        end: i64,
        order: Order,
    ) -> Result<Vec<AppInstanceMetric>, StoreError> {
        let guard = self.metrics.read().map_err(|_| StoreError::Poisoned)?;

        let mut result: Vec<AppInstanceMetric> = guard
            .get(app_id)
            .map(|series| {
                series
                    .iter()
                    .filter(|m| m.timestamp >= start && m.timestamp <= end)
                    .filter(|m| m.name == name)
                    .filter(|m| {
                        instance_index < 0 || i64::from(m.instance_index) == i64::from(instance_index)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if order == Order::Desc {
            result.reverse();
        }
        Ok(result)
    }

    async fn prune_instance_metrics(&self, before: i64) -> Result<usize, StoreError> {
        let removed = {
            let mut guard = self.metrics.write().map_err(|_| StoreError::Poisoned)?;
            let mut removed = 0;
            for series in guard.values_mut() {
                let cut = series.partition_point(|m| m.timestamp < before);
                series.drain(..cut);
                removed += cut;
            }
            guard.retain(|_, series| !series.is_empty());
            removed
        };

        if removed > 0 {
            self.write_snapshot()?;
        }
        Ok(removed)
    }
}
