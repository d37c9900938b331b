//! Envelope processor worker
//!
//! Each worker owns one input queue of envelopes and converts them into
//! normalized samples. Gauges are converted immediately; HTTP timers are
//! accumulated per application and instance and turned into throughput and
//! response-time samples once per collect interval.

use super::{AppIdSource, LoopHandle};
use crate::health::{components, HealthRegistry};
use crate::models::{
    now_nanos, AppInstanceMetric, METRIC_NAME_CPU_UTIL, METRIC_NAME_MEMORY_USED,
    METRIC_NAME_MEMORY_UTIL, METRIC_NAME_RESPONSE_TIME, METRIC_NAME_THROUGHPUT,
    UNIT_MEGABYTES, UNIT_MILLISECONDS, UNIT_PERCENTAGE, UNIT_RPS,
};
use crate::observability::MetricsServerMetrics;
use crate::proto::{
    envelope, Envelope, Gauge, GAUGE_CPU, GAUGE_MEMORY, GAUGE_MEMORY_QUOTA, TIMER_HTTP,
};
use crate::shard;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const BYTES_PER_MEGABYTE: f64 = 1024.0 * 1024.0;
const NANOS_PER_MILLI: f64 = 1_000_000.0;

/// Running request statistics for one application instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct HttpTiming {
    count: u64,
    sum_nanos: i64,
}

impl HttpTiming {
    /// Timer values arrive from the network: a negative duration counts as
    /// zero and the sum saturates instead of overflowing.
    fn record(&mut self, duration_nanos: i64) {
        self.count = self.count.saturating_add(1);
        self.sum_nanos = self.sum_nanos.saturating_add(duration_nanos.max(0));
    }
}

/// One worker of the envelope processor pool
pub struct EnvelopeProcessor {
    index: usize,
    worker_count: usize,
    collect_interval: Duration,
    envelope_rx: mpsc::Receiver<Envelope>,
    metric_tx: mpsc::Sender<AppInstanceMetric>,
    app_ids: Arc<dyn AppIdSource>,
    timings: HashMap<String, HashMap<u32, HttpTiming>>,
    metrics: MetricsServerMetrics,
    health: Option<HealthRegistry>,
}

impl EnvelopeProcessor {
    /// Create worker `index` out of `worker_count`
    pub fn new(
        index: usize,
        worker_count: usize,
        collect_interval: Duration,
        envelope_rx: mpsc::Receiver<Envelope>,
        metric_tx: mpsc::Sender<AppInstanceMetric>,
        app_ids: Arc<dyn AppIdSource>,
    ) -> Self {
        Self {
            index,
            worker_count,
            collect_interval,
            envelope_rx,
            metric_tx,
            app_ids,
            timings: HashMap::new(),
            metrics: MetricsServerMetrics::new(),
            health: None,
        }
    }

    /// Report a worker that stops before shutdown as unhealthy
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Spawn the worker loop
    pub fn start(self) -> LoopHandle {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(self.run(shutdown_rx));
        LoopHandle::new(shutdown_tx, vec![task])
    }

    /// Worker loop: converts envelopes as they arrive and emits windowed
    /// HTTP metrics on every tick
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            worker = self.index,
            collect_interval_secs = self.collect_interval.as_secs_f64(),
            "Starting envelope processor"
        );

        let mut ticker = interval_at(Instant::now() + self.collect_interval, self.collect_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let stopped = loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(worker = self.index, "Shutting down envelope processor");
                    break None;
                }
                maybe_envelope = self.envelope_rx.recv() => {
                    match maybe_envelope {
                        Some(envelope) => {
                            let samples = self.process_envelope(&envelope);
                            if !self.emit(samples).await {
                                break Some("metric channel closed");
                            }
                        }
                        None => {
                            debug!(worker = self.index, "Envelope channel closed");
                            break Some("envelope channel closed");
                        }
                    }
                }
                _ = ticker.tick() => {
                    let samples = self.compute_metrics();
                    if !self.emit(samples).await {
                        break Some("metric channel closed");
                    }
                }
            }
        };

        if let (Some(reason), Some(health)) = (stopped, &self.health) {
            health
                .set_unhealthy(
                    components::ENVELOPE_PROCESSORS,
                    format!("worker {} stopped: {}", self.index, reason),
                )
                .await;
        }
    }

    async fn emit(&self, samples: Vec<AppInstanceMetric>) -> bool {
        if samples.is_empty() {
            return true;
        }
        self.metrics.add_samples_emitted(samples.len());

        for sample in samples {
            if self.metric_tx.send(sample).await.is_err() {
                warn!(worker = self.index, "Metric channel closed, stopping processor");
                return false;
            }
        }
        true
    }

    /// Convert one envelope. Timers only update the accumulators.
    pub fn process_envelope(&mut self, envelope: &Envelope) -> Vec<AppInstanceMetric> {
        match envelope.message.as_ref() {
            Some(envelope::Message::Gauge(gauge)) => {
                if gauge.metrics.contains_key(GAUGE_MEMORY_QUOTA) {
                    container_metrics(envelope, gauge)
                } else {
                    custom_metrics(envelope, gauge)
                }
            }
            Some(envelope::Message::Timer(timer)) if timer.name == TIMER_HTTP => {
                let entry = self
                    .timings
                    .entry(envelope.source_id.clone())
                    .or_default()
                    .entry(instance_index(envelope))
                    .or_default();
                entry.record(timer.stop.saturating_sub(timer.start));
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    /// Produce throughput and response time for the window that just ended
    /// and reset the accumulators.
    pub fn compute_metrics(&mut self) -> Vec<AppInstanceMetric> {
        let now = now_nanos();
        let interval_secs = self.collect_interval.as_secs_f64();
        let mut samples = Vec::new();

        for app_id in self.app_ids.app_ids() {
            match self.timings.get(&app_id) {
                Some(instances) if !instances.is_empty() => {
                    for (&instance_index, timing) in instances {
                        let throughput = timing.count as f64 / interval_secs;
                        let response_time =
                            timing.sum_nanos as f64 / (timing.count as f64 * NANOS_PER_MILLI);

                        samples.push(sample(
                            &app_id,
                            instance_index,
                            METRIC_NAME_THROUGHPUT,
                            UNIT_RPS,
                            throughput,
                            now,
                            now,
                        ));
                        samples.push(sample(
                            &app_id,
                            instance_index,
                            METRIC_NAME_RESPONSE_TIME,
                            UNIT_MILLISECONDS,
                            response_time,
                            now,
                            now,
                        ));
                    }
                }
                _ => {
                    // Only one worker reports idle apps
                    if shard::is_owner(&app_id, self.index, self.worker_count) {
                        samples.push(sample(
                            &app_id,
                            0,
                            METRIC_NAME_THROUGHPUT,
                            UNIT_RPS,
                            0.0,
                            now,
                            now,
                        ));
                        samples.push(sample(
                            &app_id,
                            0,
                            METRIC_NAME_RESPONSE_TIME,
                            UNIT_MILLISECONDS,
                            0.0,
                            now,
                            now,
                        ));
                    }
                }
            }
        }

        self.timings.clear();
        samples
    }
}

fn instance_index(envelope: &Envelope) -> u32 {
    envelope.instance_id.parse().unwrap_or(0)
}

/// Ceiling-rounded, non-negative integer rendering
fn ceil_string(value: f64) -> String {
    let rounded = value.ceil();
    if rounded.is_finite() && rounded > 0.0 {
        format!("{}", rounded as u64)
    } else {
        "0".to_string()
    }
}

fn sample(
    app_id: &str,
    instance_index: u32,
    name: &str,
    unit: &str,
    value: f64,
    collected_at: i64,
    timestamp: i64,
) -> AppInstanceMetric {
    AppInstanceMetric {
        app_id: app_id.to_string(),
        instance_index,
        collected_at,
        name: name.to_string(),
        unit: unit.to_string(),
        value: ceil_string(value),
        timestamp,
    }
}

fn container_metrics(envelope: &Envelope, gauge: &Gauge) -> Vec<AppInstanceMetric> {
    let instance_index = instance_index(envelope);
    let collected_at = now_nanos();
    let value_of = |key: &str| gauge.metrics.get(key).map(|v| v.value);

    let mut samples = Vec::with_capacity(3);

    if let Some(memory) = value_of(GAUGE_MEMORY) {
        samples.push(sample(
            &envelope.source_id,
            instance_index,
            METRIC_NAME_MEMORY_USED,
            UNIT_MEGABYTES,
            memory / BYTES_PER_MEGABYTE,
            collected_at,
            envelope.timestamp,
        ));

        match value_of(GAUGE_MEMORY_QUOTA) {
            Some(quota) if quota != 0.0 => samples.push(sample(
                &envelope.source_id,
                instance_index,
                METRIC_NAME_MEMORY_UTIL,
                UNIT_PERCENTAGE,
                memory / quota * 100.0,
                collected_at,
                envelope.timestamp,
            )),
            _ => {}
        }
    }

    if let Some(cpu) = value_of(GAUGE_CPU) {
        samples.push(sample(
            &envelope.source_id,
            instance_index,
            METRIC_NAME_CPU_UTIL,
            UNIT_PERCENTAGE,
            cpu,
            collected_at,
            envelope.timestamp,
        ));
    }

    samples
}

fn custom_metrics(envelope: &Envelope, gauge: &Gauge) -> Vec<AppInstanceMetric> {
    let instance_index = instance_index(envelope);
    let collected_at = now_nanos();

    gauge
        .metrics
        .iter()
        .map(|(name, value)| {
            sample(
                &envelope.source_id,
                instance_index,
                name,
                &value.unit,
                value.value,
                collected_at,
                envelope.timestamp,
            )
        })
        .collect()
}
