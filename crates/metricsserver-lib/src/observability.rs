//! Observability infrastructure for the metrics server
//!
//! Provides:
//! - Prometheus metrics (ingestion volume, owned apps, cache hit ratio, query latency)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter,
    IntGauge,
};
use std::sync::OnceLock;
use tracing::{error, info, warn};

/// Default histogram buckets for latency measurements (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<MetricsInner> = OnceLock::new();

struct MetricsInner {
    envelopes_received: IntCounter,
    samples_emitted: IntCounter,
    owned_apps: IntGauge,
    ws_connections: IntGauge,
    query_latency_seconds: Histogram,
    cache_hits: IntCounter,
    cache_misses: IntCounter,
    flush_errors: IntCounter,
    refresh_errors: IntCounter,
}

impl MetricsInner {
    fn new() -> Self {
        Self {
            envelopes_received: register_int_counter!(
                "metricsserver_envelopes_received_total",
                "Envelopes received over the ingestion websocket"
            )
            .expect("Failed to register envelopes_received"),

            samples_emitted: register_int_counter!(
                "metricsserver_samples_emitted_total",
                "Normalized metric samples produced by envelope processors"
            )
            .expect("Failed to register samples_emitted"),

            owned_apps: register_int_gauge!(
                "metricsserver_owned_apps",
                "Applications owned by this node"
            )
            .expect("Failed to register owned_apps"),

            ws_connections: register_int_gauge!(
                "metricsserver_ws_connections",
                "Open ingestion websocket connections"
            )
            .expect("Failed to register ws_connections"),

            query_latency_seconds: register_histogram!(
                "metricsserver_query_latency_seconds",
                "Time spent answering metric history queries",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register query_latency_seconds"),

            cache_hits: register_int_counter!(
                "metricsserver_cache_hits_total",
                "Queries answered from the in-memory cache"
            )
            .expect("Failed to register cache_hits"),

            cache_misses: register_int_counter!(
                "metricsserver_cache_misses_total",
                "Queries that fell back to the durable store"
            )
            .expect("Failed to register cache_misses"),

            flush_errors: register_int_counter!(
                "metricsserver_flush_errors_total",
                "Failed bulk saves to the durable store"
            )
            .expect("Failed to register flush_errors"),

            refresh_errors: register_int_counter!(
                "metricsserver_refresh_errors_total",
                "Failed application list refreshes"
            )
            .expect("Failed to register refresh_errors"),
        }
    }
}

/// Metrics server metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct MetricsServerMetrics {
    _private: (),
}

impl Default for MetricsServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsServerMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(MetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &MetricsInner {
        GLOBAL_METRICS.get_or_init(MetricsInner::new)
    }

    pub fn inc_envelopes_received(&self) {
        self.inner().envelopes_received.inc();
    }

    pub fn add_samples_emitted(&self, count: usize) {
        self.inner().samples_emitted.inc_by(count as u64);
    }

    pub fn set_owned_apps(&self, count: usize) {
        self.inner().owned_apps.set(count as i64);
    }

    pub fn inc_ws_connections(&self) {
        self.inner().ws_connections.inc();
    }

    pub fn dec_ws_connections(&self) {
        self.inner().ws_connections.dec();
    }

    pub fn observe_query_latency(&self, duration_secs: f64) {
        self.inner().query_latency_seconds.observe(duration_secs);
    }

    pub fn inc_cache_hits(&self) {
        self.inner().cache_hits.inc();
    }

    pub fn inc_cache_misses(&self) {
        self.inner().cache_misses.inc();
    }

    pub fn inc_flush_errors(&self) {
        self.inner().flush_errors.inc();
    }

    pub fn inc_refresh_errors(&self) {
        self.inner().refresh_errors.inc();
    }
}

/// Structured logger for metrics server events
#[derive(Clone)]
pub struct StructuredLogger {
    node_index: usize,
}

impl StructuredLogger {
    pub fn new(node_index: usize) -> Self {
        Self { node_index }
    }

    pub fn log_startup(&self, version: &str, node_addrs: &[String]) {
        info!(
            event = "metricsserver_started",
            node_index = self.node_index,
            version = %version,
            node_addrs = ?node_addrs,
            "Metrics server started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "metricsserver_shutdown",
            node_index = self.node_index,
            reason = %reason,
            "Metrics server shutting down"
        );
    }

    pub fn log_apps_refreshed(&self, owned: usize, added: usize, removed: usize) {
        info!(
            event = "apps_refreshed",
            node_index = self.node_index,
            owned = owned,
            added = added,
            removed = removed,
            "Refreshed owned applications"
        );
    }

    pub fn log_refresh_failed(&self, error: &str) {
        error!(
            event = "refresh_failed",
            node_index = self.node_index,
            error = %error,
            "Failed to refresh applications from policy store"
        );
    }

    pub fn log_metrics_flushed(&self, count: usize, error: Option<&str>) {
        match error {
            None => info!(
                event = "metrics_flushed",
                node_index = self.node_index,
                count = count,
                "Saved metrics to durable store"
            ),
            Some(e) => error!(
                event = "metrics_flushed",
                node_index = self.node_index,
                count = count,
                error = %e,
                "Failed to save metrics to durable store, batch dropped"
            ),
        }
    }

    pub fn log_ws_opened(&self, peer: &str) {
        info!(
            event = "ws_connection_opened",
            node_index = self.node_index,
            peer = %peer,
            "Ingestion connection opened"
        );
    }

    pub fn log_ws_closed(&self, peer: &str, reason: &str) {
        warn!(
            event = "ws_connection_closed",
            node_index = self.node_index,
            peer = %peer,
            reason = %reason,
            "Ingestion connection closed"
        );
    }
}
