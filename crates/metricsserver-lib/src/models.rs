//! Core data models for the metrics server

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

pub const METRIC_NAME_MEMORY_USED: &str = "memoryused";
pub const METRIC_NAME_MEMORY_UTIL: &str = "memoryutil";
pub const METRIC_NAME_CPU_UTIL: &str = "cpu";
pub const METRIC_NAME_THROUGHPUT: &str = "throughput";
pub const METRIC_NAME_RESPONSE_TIME: &str = "responsetime";

pub const UNIT_MEGABYTES: &str = "MB";
pub const UNIT_PERCENTAGE: &str = "%";
pub const UNIT_RPS: &str = "rps";
pub const UNIT_MILLISECONDS: &str = "ms";

/// Label key matched against the sample's metric name
pub const LABEL_NAME: &str = "name";
/// Label key matched against the sample's instance index
pub const LABEL_INSTANCE_INDEX: &str = "instance_index";

/// One normalized metric sample for a single application instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInstanceMetric {
    pub app_id: String,
    pub instance_index: u32,
    /// Wall-clock time (unix nanoseconds) the sample was produced
    pub collected_at: i64,
    pub name: String,
    pub unit: String,
    /// Ceiling-rounded integer rendered as a decimal string
    pub value: String,
    /// Event time (unix nanoseconds) reported by the source
    pub timestamp: i64,
}

impl AppInstanceMetric {
    /// Check that every label in `labels` matches this sample.
    /// Unknown label keys never match.
    pub fn matches_labels(&self, labels: &HashMap<String, String>) -> bool {
        labels.iter().all(|(key, expected)| match key.as_str() {
            LABEL_NAME => &self.name == expected,
            LABEL_INSTANCE_INDEX => self.instance_index.to_string() == *expected,
            _ => false,
        })
    }
}

/// Sort order for range queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Order {
    #[default]
    Asc,
    Desc,
}

impl Order {
    pub const ASC_STR: &'static str = "ASC";
    pub const DESC_STR: &'static str = "DESC";
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Order::Asc => f.write_str(Self::ASC_STR),
            Order::Desc => f.write_str(Self::DESC_STR),
        }
    }
}

impl FromStr for Order {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            Self::ASC_STR => Ok(Order::Asc),
            Self::DESC_STR => Ok(Order::Desc),
            _ => Err(()),
        }
    }
}

/// JSON error body returned by the HTTP endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

/// Current wall-clock time in unix nanoseconds
pub fn now_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
}
