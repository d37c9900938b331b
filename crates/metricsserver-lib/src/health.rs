//! Liveness and readiness state of the metrics server
//!
//! Background loops report the state of the collaborators they depend on
//! (policy store, metrics store, processors, ingestion listener). The
//! worst component status becomes the node status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Component status, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Still serving, e.g. a flush or refresh failed and will be retried
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    /// Whether the node keeps answering probes with 200
    pub fn is_operational(&self) -> bool {
        *self != ComponentStatus::Unhealthy
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ComponentHealth {
    fn new(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            updated_at: Utc::now(),
        }
    }

    pub fn healthy() -> Self {
        Self::new(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::new(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::new(ComponentStatus::Unhealthy, Some(message.into()))
    }
}

/// Body of `/healthz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Worst status across `components`; no components means healthy
    pub fn compute_status(components: &BTreeMap<String, ComponentHealth>) -> ComponentStatus {
        components
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy)
    }
}

/// Body of `/readyz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names reported by the metrics server
pub mod components {
    pub const COLLECTOR: &str = "collector";
    pub const ENVELOPE_PROCESSORS: &str = "envelope_processors";
    pub const POLICY_STORE: &str = "policy_store";
    pub const METRICS_STORE: &str = "metrics_store";
    pub const INGESTION: &str = "ingestion";

    /// Every component registered at startup
    pub const ALL: [&str; 5] = [
        COLLECTOR,
        ENVELOPE_PROCESSORS,
        POLICY_STORE,
        METRICS_STORE,
        INGESTION,
    ];
}

#[derive(Debug, Default)]
struct HealthState {
    components: BTreeMap<String, ComponentHealth>,
    initialized: bool,
}

/// Shared, cloneable view of component health
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    state: Arc<RwLock<HealthState>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `name` as healthy
    pub async fn register(&self, name: &str) {
        self.state
            .write()
            .await
            .components
            .insert(name.to_string(), ComponentHealth::healthy());
    }

    /// Record a new state for `name`, logging status transitions
    pub async fn update(&self, name: &str, health: ComponentHealth) {
        let mut state = self.state.write().await;
        let previous = state.components.get(name).map(|c| c.status);

        if previous != Some(health.status) {
            match health.status {
                ComponentStatus::Healthy => {
                    info!(component = name, "Component recovered");
                }
                status => warn!(
                    component = name,
                    status = ?status,
                    message = health.message.as_deref().unwrap_or_default(),
                    "Component health changed"
                ),
            }
        }

        state.components.insert(name.to_string(), health);
    }

    pub async fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message)).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    /// Flip readiness once startup completes, and back off on shutdown
    pub async fn set_ready(&self, ready: bool) {
        self.state.write().await.initialized = ready;
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.state.read().await.components.clone();
        HealthResponse {
            status: HealthResponse::compute_status(&components),
            components,
        }
    }

    /// Ready once initialized and while no component is unhealthy
    pub async fn readiness(&self) -> ReadinessResponse {
        let state = self.state.read().await;

        if !state.initialized {
            return ReadinessResponse {
                ready: false,
                reason: Some("Metrics server not yet initialized".to_string()),
            };
        }

        let unhealthy: Vec<&str> = state
            .components
            .iter()
            .filter(|(_, c)| c.status == ComponentStatus::Unhealthy)
            .map(|(name, _)| name.as_str())
            .collect();

        if unhealthy.is_empty() {
            ReadinessResponse {
                ready: true,
                reason: None,
            }
        } else {
            ReadinessResponse {
                ready: false,
                reason: Some(format!("Unhealthy components: {}", unhealthy.join(", "))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn registry_with_all() -> HealthRegistry {
        let registry = HealthRegistry::new();
        for name in components::ALL {
            registry.register(name).await;
        }
        registry
    }

    #[test]
    fn test_status_ordering() {
        assert!(ComponentStatus::Healthy < ComponentStatus::Degraded);
        assert!(ComponentStatus::Degraded < ComponentStatus::Unhealthy);
        assert!(ComponentStatus::Degraded.is_operational());
        assert!(!ComponentStatus::Unhealthy.is_operational());
    }

    #[tokio::test]
    async fn test_empty_registry_is_healthy() {
        let health = HealthRegistry::new().health().await;

        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(health.components.is_empty());
    }

    #[tokio::test]
    async fn test_policy_store_failure_degrades_node() {
        let registry = registry_with_all().await;
        registry
            .set_degraded(components::POLICY_STORE, "policy store unreachable")
            .await;

        let health = registry.health().await;
        assert_eq!(health.components.len(), 5);
        assert_eq!(health.status, ComponentStatus::Degraded);
        assert_eq!(
            health.components[components::POLICY_STORE].message.as_deref(),
            Some("policy store unreachable")
        );

        registry.set_healthy(components::POLICY_STORE).await;
        assert_eq!(registry.health().await.status, ComponentStatus::Healthy);
    }

    #[tokio::test]
    async fn test_worst_status_wins() {
        let registry = registry_with_all().await;
        registry
            .set_degraded(components::METRICS_STORE, "flush failed")
            .await;
        registry
            .set_unhealthy(components::ENVELOPE_PROCESSORS, "stopped")
            .await;

        assert_eq!(registry.health().await.status, ComponentStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_readiness_lifecycle() {
        let registry = registry_with_all().await;

        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(
            readiness.reason.as_deref(),
            Some("Metrics server not yet initialized")
        );

        registry.set_ready(true).await;
        registry
            .set_degraded(components::METRICS_STORE, "flush failed")
            .await;
        assert!(registry.readiness().await.ready);

        registry.set_ready(false).await;
        assert!(!registry.readiness().await.ready);
    }

    #[tokio::test]
    async fn test_readiness_names_unhealthy_components() {
        let registry = registry_with_all().await;
        registry.set_ready(true).await;
        registry
            .set_unhealthy(components::INGESTION, "listener closed")
            .await;

        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(
            readiness.reason.as_deref(),
            Some("Unhealthy components: ingestion")
        );
    }

    #[test]
    fn test_health_serializes_lowercase_status() {
        let json = serde_json::to_value(ComponentHealth::degraded("slow")).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["message"], "slow");
        assert!(json.get("updated_at").is_some());
    }
}
