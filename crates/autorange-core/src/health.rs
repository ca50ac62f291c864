//! Liveness and readiness of the agent
//!
//! Two components feed the probes. The sampler is judged after every
//! sampling pass from how many workloads could be read. The watchers are
//! judged by discovery: an unreadable workloads file or watchers that gave
//! up applying their limits degrade them.

use crate::watcher::{WatcherPhase, WatcherReport};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Component names for health tracking
pub mod components {
    pub const SAMPLER: &str = "sampler";
    pub const WATCHERS: &str = "watchers";
}

/// Ordered from best to worst, so the overall status is the maximum
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    /// Degraded components still serve traffic
    pub fn is_operational(&self) -> bool {
        *self != ComponentStatus::Unhealthy
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    fn new(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            last_check_timestamp: chrono::Utc::now().timestamp(),
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

    /// Sampler health after one pass: some failures degrade, failing every
    /// workload is unhealthy. A pass with nothing to sample is healthy.
    pub fn from_sampling(sampled: usize, failed: usize) -> Self {
        match (sampled, failed) {
            (_, 0) => Self::healthy(),
            (0, _) => Self::unhealthy("No workload could be sampled"),
            (_, failed) => Self::degraded(format!("{} workloads failed to sample", failed)),
        }
    }

    /// Watcher health from their latest reports. Exhausted limit updates
    /// degrade; exited workloads are normal churn.
    pub fn from_watchers(reports: &[WatcherReport]) -> Self {
        let failed: Vec<&str> = reports
            .iter()
            .filter(|r| r.phase == WatcherPhase::ApplyFailed)
            .map(|r| r.workload.id.as_str())
            .collect();

        if failed.is_empty() {
            Self::healthy()
        } else {
            Self::degraded(format!(
                "Applying limits failed for {}",
                failed.join(", ")
            ))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Overall status is the worst component status
    pub fn from_components(components: HashMap<String, ComponentHealth>) -> Self {
        let status = components
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy);
        Self { status, components }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Default)]
struct RegistryState {
    components: HashMap<String, ComponentHealth>,
    ready: bool,
}

/// Shared view of component health, cloned into every task that reports
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component as healthy until it reports otherwise
    pub async fn register(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn update(&self, name: &str, health: ComponentHealth) {
        self.state
            .write()
            .await
            .components
            .insert(name.to_string(), health);
    }

    /// Flip once startup wiring is complete
    pub async fn set_ready(&self, ready: bool) {
        self.state.write().await.ready = ready;
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.state.read().await.components.clone();
        HealthResponse::from_components(components)
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let (ready, health) = {
            let state = self.state.read().await;
            (
                state.ready,
                HealthResponse::from_components(state.components.clone()),
            )
        };

        let reason = if !ready {
            Some("Agent not yet initialized")
        } else if !health.status.is_operational() {
            Some("Critical component unhealthy")
        } else {
            None
        };

        ReadinessResponse {
            ready: reason.is_none(),
            reason: reason.map(str::to_string),
        }
    }
}
