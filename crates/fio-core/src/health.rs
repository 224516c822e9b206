//! Component health for liveness and readiness probes.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

/// Pipeline components whose health is tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Component {
    /// Input topic consumer
    Consumer,
    /// Attribute lookup services
    Lookup,
    /// Output topic producer
    Publisher,
}

impl Component {
    pub const ALL: [Component; 3] = [Component::Consumer, Component::Lookup, Component::Publisher];

    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Consumer => "consumer",
            Component::Lookup => "lookup",
            Component::Publisher => "publisher",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health status of a component.
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentStatus {
    Healthy,
    /// Working, but recent operations failed
    Degraded(String),
    Unhealthy(String),
    /// Not reported yet
    Unknown,
}

/// Overall health.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

/// Shared health registry, updated by the pipeline and read by the server.
pub struct HealthCheck {
    components: RwLock<BTreeMap<Component, ComponentStatus>>,
    started_at: Instant,
    running: RwLock<bool>,
}

impl HealthCheck {
    /// Create a registry with every component in `Unknown` state.
    pub fn new() -> Self {
        let components = Component::ALL
            .iter()
            .map(|c| (*c, ComponentStatus::Unknown))
            .collect();
        Self {
            components: RwLock::new(components),
            started_at: Instant::now(),
            running: RwLock::new(false),
        }
    }

    pub fn mark_healthy(&self, component: Component) {
        self.set(component, ComponentStatus::Healthy);
    }

    pub fn mark_degraded(&self, component: Component, reason: impl Into<String>) {
        self.set(component, ComponentStatus::Degraded(reason.into()));
    }

    pub fn mark_unhealthy(&self, component: Component, reason: impl Into<String>) {
        self.set(component, ComponentStatus::Unhealthy(reason.into()));
    }

    fn set(&self, component: Component, status: ComponentStatus) {
        self.components.write().insert(component, status);
    }

    pub fn component_status(&self, component: Component) -> ComponentStatus {
        self.components
            .read()
            .get(&component)
            .cloned()
            .unwrap_or(ComponentStatus::Unknown)
    }

    /// Snapshot of every component status, in component order.
    pub fn all_statuses(&self) -> Vec<(Component, ComponentStatus)> {
        self.components
            .read()
            .iter()
            .map(|(c, s)| (*c, s.clone()))
            .collect()
    }

    /// Worst status across components. `Unknown` counts as healthy.
    pub fn overall_status(&self) -> HealthStatus {
        let components = self.components.read();

        let mut has_degraded = false;
        for status in components.values() {
            match status {
                ComponentStatus::Unhealthy(_) => return HealthStatus::Unhealthy,
                ComponentStatus::Degraded(_) => has_degraded = true,
                _ => {}
            }
        }

        if has_degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Healthy or degraded.
    pub fn is_operational(&self) -> bool {
        self.overall_status() != HealthStatus::Unhealthy
    }

    /// Running, operational, and the consumer has read at least once.
    pub fn is_ready(&self) -> bool {
        self.is_running()
            && self.is_operational()
            && self.component_status(Component::Consumer) != ComponentStatus::Unknown
    }

    pub fn pipeline_started(&self) {
        *self.running.write() = true;
    }

    pub fn pipeline_stopped(&self) {
        *self.running.write() = false;
    }

    pub fn is_running(&self) -> bool {
        *self.running.read()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::new()
    }
}
