//! Collaborator stores consumed by the collector
//!
//! This module provides:
//! - The policy store interface listing applications bound to the autoscaler
//! - The durable instance-metrics store interface (bulk save, range read, prune)
//! - An in-process metrics store with optional on-disk snapshot
//! - Static and file-backed policy stores
//! - A retention pruner for the durable store

mod memory;
mod policy;
mod pruner;

pub use memory::{MemoryInstanceMetricsStore, MemoryStoreConfig};
pub use policy::{FilePolicyStore, StaticPolicyStore};
pub use pruner::MetricsPruner;

use crate::models::{AppInstanceMetric, Order};
use async_trait::async_trait;
use std::collections::HashSet;
use thiserror::Error;

/// Errors returned by store collaborators
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store lock poisoned")]
    Poisoned,
}

/// Source of the application ids bound to the autoscaler
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Every application id that currently has a scaling policy
    async fn get_app_ids(&self) -> Result<HashSet<String>, StoreError>;
}

/// Durable sink and range source for instance metrics
#[async_trait]
pub trait InstanceMetricsStore: Send + Sync {
    /// Persist a batch of samples
    async fn save_metrics_in_bulk(&self, metrics: Vec<AppInstanceMetric>)
        -> Result<(), StoreError>;

    /// Samples for `app_id`/`name` with `start <= timestamp <= end`.
    /// A negative `instance_index` selects all instances.
    async fn retrieve_instance_metrics(
        &self,
        app_id: &str,
        instance_index: i32,
        name: &str,
        start: i64,
        end: i64,
        order: Order,
    ) -> Result<Vec<AppInstanceMetric>, StoreError>;

    /// Remove samples older than `before`, returning how many were removed
    async fn prune_instance_metrics(&self, before: i64) -> Result<usize, StoreError>;
}
