//! Metric collection pipeline
//!
//! This module provides the envelope processor pool that normalizes raw
//! telemetry, the registry of applications owned by this node, and the
//! collector that caches, persists and serves the resulting samples.

mod processor;
mod registry;
mod r#loop;


pub use processor::EnvelopeProcessor;
pub use r#loop::{CollectorConfig, MetricCollector};
pub use registry::{AppCache, AppRegistry, RefreshSummary};

use std::collections::HashSet;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;

/// Provider of the application ids a processor reports on
pub trait AppIdSource: Send + Sync {
    fn app_ids(&self) -> HashSet<String>;
}

impl AppIdSource for HashSet<String> {
    fn app_ids(&self) -> HashSet<String> {
        self.clone()
    }
}

/// Handle to running background loops
pub struct LoopHandle {
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl LoopHandle {
    pub(crate) fn new(shutdown: broadcast::Sender<()>, tasks: Vec<JoinHandle<()>>) -> Self {
        Self { shutdown, tasks }
    }

    /// Signal every loop and wait for it to return
    pub async fn stop(self) {
        // No receivers left means every loop already exited
        let _ = self.shutdown.send(());

        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background loop terminated abnormally");
            }
        }
    }

    /// Whether every loop has returned
    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(JoinHandle::is_finished)
    }
}
