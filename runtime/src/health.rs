//! Health reporting.
//!
//! Each listener contributes one check, derived from its current state:
//!
//! | Listener state | Check |
//! |---|---|
//! | `Streaming` | healthy |
//! | `Connecting`, `Retrying`, `Stopped` | degraded |
//! | `Terminated` | unhealthy |
//!
//! The scrape server answers `GET /health` with the resulting [`HealthReport`]
//! and status 503 when the report is unhealthy.

use crate::listener::{ListenerState, ListenerStates};
use serde::Serialize;
use std::collections::BTreeMap;

/// Health check status levels
///
/// Indicates the current health state of a component or system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Component is fully operational
    Healthy,

    /// Component is operational but not delivering events right now
    Degraded,

    /// Component is not operational
    Unhealthy,
}

impl HealthStatus {
    /// Check if status is healthy
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Check if status is unhealthy
    #[must_use]
    pub const fn is_unhealthy(self) -> bool {
        matches!(self, Self::Unhealthy)
    }

    /// Get the worst status between two statuses
    #[must_use]
    pub const fn worst(self, other: Self) -> Self {
        match (self, other) {
            (Self::Unhealthy, _) | (_, Self::Unhealthy) => Self::Unhealthy,
            (Self::Degraded, _) | (_, Self::Degraded) => Self::Degraded,
            _ => Self::Healthy,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Health check result for one listener
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    /// Name of the component being checked
    pub component: String,

    /// Current health status
    pub status: HealthStatus,

    /// Optional message providing details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Extra details (state, attempt, ...)
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl HealthCheck {
    /// Create a healthy check result
    #[must_use]
    pub fn healthy(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Healthy,
            message: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Create a degraded check result
    #[must_use]
    pub fn degraded(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Degraded,
            message: Some(message.into()),
            metadata: BTreeMap::new(),
        }
    }

    /// Create an unhealthy check result
    #[must_use]
    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
            metadata: BTreeMap::new(),
        }
    }

    /// Add metadata to the health check
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Check for one listener in `state`.
    #[must_use]
    pub fn for_listener(collection: &str, state: &ListenerState) -> Self {
        let component = format!("listener:{collection}");
        let check = match state {
            ListenerState::Streaming => Self::healthy(component),
            ListenerState::Connecting => Self::degraded(component, "opening change stream"),
            ListenerState::Retrying { attempt, delay } => {
                Self::degraded(component, "reconnecting after failure")
                    .with_metadata("attempt", attempt.to_string())
                    .with_metadata("delay_ms", delay.as_millis().to_string())
            }
            ListenerState::Stopped => Self::degraded(component, "stopped"),
            ListenerState::Terminated { reason } => Self::unhealthy(component, reason.clone()),
        };
        check.with_metadata("state", state.name())
    }
}

/// Aggregated health report
///
/// Combines multiple health checks into an overall system status.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Overall system status (worst of all checks)
    pub status: HealthStatus,

    /// Individual component checks
    pub checks: Vec<HealthCheck>,

    /// Timestamp when report was generated
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl HealthReport {
    /// Create a new health report from checks
    #[must_use]
    pub fn new(checks: Vec<HealthCheck>) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .fold(HealthStatus::Healthy, HealthStatus::worst);

        Self {
            status,
            checks,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Report covering every listener.
    #[must_use]
    pub fn from_listeners(states: &ListenerStates) -> Self {
        Self::new(
            states
                .snapshot()
                .iter()
                .map(|(collection, state)| HealthCheck::for_listener(collection, state))
                .collect(),
        )
    }

    /// Check if overall system is healthy
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        self.status.is_healthy()
    }

    /// Check if overall system is unhealthy
    #[must_use]
    pub const fn is_unhealthy(&self) -> bool {
        self.status.is_unhealthy()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::time::Duration;

    #[test]
    fn worst_status_wins() {
        assert_eq!(
            HealthStatus::Healthy.worst(HealthStatus::Degraded),
            HealthStatus::Degraded
        );
        assert_eq!(
            HealthStatus::Degraded.worst(HealthStatus::Unhealthy),
            HealthStatus::Unhealthy
        );
        assert!(HealthReport::new(Vec::new()).is_healthy());
    }

    #[test]
    fn listener_states_map_to_checks() {
        let streaming = HealthCheck::for_listener("orders", &ListenerState::Streaming);
        assert_eq!(streaming.status, HealthStatus::Healthy);
        assert_eq!(streaming.component, "listener:orders");

        let retrying = HealthCheck::for_listener(
            "orders",
            &ListenerState::Retrying {
                attempt: 2,
                delay: Duration::from_millis(2000),
            },
        );
        assert_eq!(retrying.status, HealthStatus::Degraded);
        assert_eq!(retrying.metadata.get("attempt").unwrap(), "2");
        assert_eq!(retrying.metadata.get("delay_ms").unwrap(), "2000");

        let terminated = HealthCheck::for_listener(
            "orders",
            &ListenerState::Terminated {
                reason: "retries exhausted".into(),
            },
        );
        let report = HealthReport::new(vec![streaming, terminated]);
        assert!(report.is_unhealthy());
    }

    #[test]
    fn report_serializes_lowercase_status() {
        let report = HealthReport::new(vec![HealthCheck::healthy("listener:orders")]);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["checks"][0]["component"], "listener:orders");
        assert!(json["checks"][0].get("message").is_none());
    }
}
