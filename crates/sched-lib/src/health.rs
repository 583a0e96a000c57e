//! Health and readiness tracking
//!
//! Components report their own status; `/healthz` and `/readyz` render the
//! aggregate for Kubernetes probes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Still serving, with reduced guarantees
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    fn with(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names for health tracking
pub mod components {
    pub const DIRECTORY: &str = "directory";
    pub const REPOSITORY: &str = "repository";
    pub const RESOLVER: &str = "resolver";
    pub const INTAKE: &str = "intake";
}

#[derive(Debug)]
struct Readiness {
    ready: bool,
    pending_reason: String,
}

/// Shared health registry; clones observe the same state
#[derive(Debug, Clone)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentHealth>>>,
    readiness: Arc<RwLock<Readiness>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            components: Arc::new(RwLock::new(HashMap::new())),
            readiness: Arc::new(RwLock::new(Readiness {
                ready: false,
                pending_reason: "Service not yet initialized".to_string(),
            })),
        }
    }

    pub async fn register(&self, name: &str) {
        self.set(name, ComponentHealth::with(ComponentStatus::Healthy, None))
            .await;
    }

    async fn set(&self, name: &str, health: ComponentHealth) {
        self.components
            .write()
            .await
            .insert(name.to_string(), health);
    }

    pub async fn set_healthy(&self, name: &str) {
        self.set(name, ComponentHealth::with(ComponentStatus::Healthy, None))
            .await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.set(
            name,
            ComponentHealth::with(ComponentStatus::Degraded, Some(message.into())),
        )
        .await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.set(
            name,
            ComponentHealth::with(ComponentStatus::Unhealthy, Some(message.into())),
        )
        .await;
    }

    pub async fn set_ready(&self, ready: bool) {
        self.readiness.write().await.ready = ready;
    }

    /// Reason reported by `/readyz` while not ready
    pub async fn set_pending_reason(&self, reason: impl Into<String>) {
        self.readiness.write().await.pending_reason = reason.into();
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        let status = if components
            .values()
            .any(|c| c.status == ComponentStatus::Unhealthy)
        {
            ComponentStatus::Unhealthy
        } else if components
            .values()
            .any(|c| c.status == ComponentStatus::Degraded)
        {
            ComponentStatus::Degraded
        } else {
            ComponentStatus::Healthy
        };
        HealthResponse { status, components }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let (ready, pending_reason) = {
            let r = self.readiness.read().await;
            (r.ready, r.pending_reason.clone())
        };

        if !ready {
            return ReadinessResponse {
                ready: false,
                reason: Some(pending_reason),
            };
        }
        if self.health().await.status == ComponentStatus::Unhealthy {
            return ReadinessResponse {
                ready: false,
                reason: Some("Critical component unhealthy".to_string()),
            };
        }
        ReadinessResponse {
            ready: true,
            reason: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_aggregate_status() {
        let registry = HealthRegistry::new();
        registry.register(components::DIRECTORY).await;
        registry.register(components::REPOSITORY).await;
        assert_eq!(registry.health().await.status, ComponentStatus::Healthy);

        registry
            .set_degraded(components::DIRECTORY, "cache not synced")
            .await;
        assert_eq!(registry.health().await.status, ComponentStatus::Degraded);

        registry
            .set_unhealthy(components::REPOSITORY, "unreachable")
            .await;
        assert_eq!(registry.health().await.status, ComponentStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_readiness_reports_pending_reason() {
        let registry = HealthRegistry::new();
        registry
            .set_pending_reason("Waiting for pod cache sync")
            .await;

        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(
            readiness.reason.as_deref(),
            Some("Waiting for pod cache sync")
        );

        registry.set_ready(true).await;
        assert!(registry.readiness().await.ready);
    }

    #[tokio::test]
    async fn test_not_ready_when_unhealthy() {
        let registry = HealthRegistry::new();
        registry.register(components::RESOLVER).await;
        registry.set_ready(true).await;
        registry
            .set_unhealthy(components::RESOLVER, "proc root unreadable")
            .await;

        assert!(!registry.readiness().await.ready);
    }
}
