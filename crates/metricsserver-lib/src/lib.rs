//! Metrics server library for the application autoscaler
//!
//! This crate provides the core functionality for:
//! - Envelope ingestion over WebSocket and normalization into metric samples
//! - Hash-based sharding of applications across nodes and processors
//! - Bounded per-application caching with durable-store fallback
//! - Metric history queries with redirects to the owning node
//! - Health checks and observability

pub mod cache;
pub mod collector;
pub mod health;
pub mod models;
pub mod observability;
pub mod proto;
pub mod server;
pub mod shard;
pub mod store;

pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{MetricsServerMetrics, StructuredLogger};
