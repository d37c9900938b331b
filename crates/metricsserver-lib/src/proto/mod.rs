//! Telemetry envelope messages
//!
//! Wire-compatible with the loggregator v2 `Envelope` schema. Only the
//! fields the metrics server reads are declared; unknown fields are skipped
//! by the decoder.

use prost::Message;
use std::collections::HashMap;

/// Gauge metric carrying the container memory quota
pub const GAUGE_MEMORY_QUOTA: &str = "memory_quota";
/// Gauge metric carrying container memory usage in bytes
pub const GAUGE_MEMORY: &str = "memory";
/// Gauge metric carrying container CPU usage in percent
pub const GAUGE_CPU: &str = "cpu";
/// Timer name used by the router for request start/stop events
pub const TIMER_HTTP: &str = "http";

#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    #[prost(int64, tag = "1")]
    pub timestamp: i64,
    #[prost(string, tag = "2")]
    pub source_id: String,
    #[prost(string, tag = "8")]
    pub instance_id: String,
    #[prost(map = "string, string", tag = "9")]
    pub tags: HashMap<String, String>,
    #[prost(oneof = "envelope::Message", tags = "4, 5, 6, 7, 10")]
    pub message: Option<envelope::Message>,
}

pub mod envelope {
    use prost::Oneof;

    #[derive(Clone, PartialEq, Oneof)]
    pub enum Message {
        #[prost(message, tag = "4")]
        Log(super::Log),
        #[prost(message, tag = "5")]
        Counter(super::Counter),
        #[prost(message, tag = "6")]
        Gauge(super::Gauge),
        #[prost(message, tag = "7")]
        Timer(super::Timer),
        #[prost(message, tag = "10")]
        Event(super::Event),
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct Log {
    #[prost(bytes = "vec", tag = "1")]
    pub payload: Vec<u8>,
    #[prost(int32, tag = "2")]
    pub r#type: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct Counter {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(uint64, tag = "2")]
    pub delta: u64,
    #[prost(uint64, tag = "3")]
    pub total: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct Gauge {
    #[prost(map = "string, message", tag = "1")]
    pub metrics: HashMap<String, GaugeValue>,
}

#[derive(Clone, PartialEq, Message)]
pub struct GaugeValue {
    #[prost(string, tag = "1")]
    pub unit: String,
    #[prost(double, tag = "2")]
    pub value: f64,
}

#[derive(Clone, PartialEq, Message)]
pub struct Timer {
    #[prost(string, tag = "1")]
    pub name: String,
    /// Start time in unix nanoseconds
    #[prost(int64, tag = "2")]
    pub start: i64,
    /// Stop time in unix nanoseconds
    #[prost(int64, tag = "3")]
    pub stop: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct Event {
    #[prost(string, tag = "1")]
    pub title: String,
    #[prost(string, tag = "2")]
    pub body: String,
}

impl Envelope {
    /// Container metrics envelope as emitted by the cell's rep
    pub fn container_metrics(
        source_id: &str,
        instance_id: &str,
        cpu_percent: f64,
        memory_bytes: f64,
        memory_quota_bytes: f64,
        timestamp: i64,
    ) -> Self {
        let metrics = [
            (GAUGE_CPU, "percentage", cpu_percent),
            (GAUGE_MEMORY, "bytes", memory_bytes),
            (GAUGE_MEMORY_QUOTA, "bytes", memory_quota_bytes),
        ]
        .into_iter()
        .map(|(name, unit, value)| {
            (
                name.to_string(),
                GaugeValue {
                    unit: unit.to_string(),
                    value,
                },
            )
        })
        .collect();

        Self::with_message(
            source_id,
            instance_id,
            timestamp,
            envelope::Message::Gauge(Gauge { metrics }),
        )
    }

    /// Single-value custom metric gauge envelope
    pub fn custom_metric(
        source_id: &str,
        instance_id: &str,
        name: &str,
        unit: &str,
        value: f64,
        timestamp: i64,
    ) -> Self {
        let mut metrics = HashMap::new();
        metrics.insert(
            name.to_string(),
            GaugeValue {
                unit: unit.to_string(),
                value,
            },
        );
        Self::with_message(
            source_id,
            instance_id,
            timestamp,
            envelope::Message::Gauge(Gauge { metrics }),
        )
    }

    /// HTTP start/stop timer envelope
    pub fn http_timer(
        source_id: &str,
        instance_id: &str,
        start: i64,
        stop: i64,
        timestamp: i64,
    ) -> Self {
        Self::with_message(
            source_id,
            instance_id,
            timestamp,
            envelope::Message::Timer(Timer {
                name: TIMER_HTTP.to_string(),
                start,
                stop,
            }),
        )
    }

    fn with_message(
        source_id: &str,
        instance_id: &str,
        timestamp: i64,
        message: envelope::Message,
    ) -> Self {
        Self {
            timestamp,
            source_id: source_id.to_string(),
            instance_id: instance_id.to_string(),
            tags: HashMap::new(),
            message: Some(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_gauge_envelope() {
        let envelope = Envelope::container_metrics("app", "2", 10.2, 1024.0, 2048.0, 1111);
        let bytes = envelope.encode_to_vec();

        let decoded = Envelope::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded.source_id, "app");
        assert_eq!(decoded.instance_id, "2");
        match decoded.message {
            Some(envelope::Message::Gauge(g)) => {
                assert_eq!(g.metrics.len(), 3);
                assert_eq!(g.metrics[GAUGE_MEMORY_QUOTA].value, 2048.0);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(Envelope::decode(&[0xff, 0xff, 0xff][..]).is_err());
    }
}
