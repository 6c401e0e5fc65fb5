use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Health state of a peer node.
///
/// `Unknown -> Healthy <-> Unhealthy`; a node never returns to `Unknown`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Healthy => write!(f, "healthy"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// A peer cache node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheNode {
    pub id: String,
    /// Base URL of the node's peer protocol, e.g. `http://10.0.0.7:7400`.
    pub url: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub status: HealthStatus,
    #[serde(default)]
    pub last_health_check_at_ms: Option<i64>,
    #[serde(default)]
    pub last_latency_ms: Option<u64>,
    #[serde(default)]
    pub consecutive_failures: u32,
}

impl CacheNode {
    pub fn new(id: impl Into<String>, url: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into().trim_end_matches('/').to_string(),
            region: region.into(),
            status: HealthStatus::Unknown,
            last_health_check_at_ms: None,
            last_latency_ms: None,
            consecutive_failures: 0,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    /// Nodes that have not failed yet take part in the peer tier; a freshly
    /// registered node is used before its first probe completes.
    pub fn is_routable(&self) -> bool {
        self.status != HealthStatus::Unhealthy
    }

    /// Apply a successful probe. Returns the previous status.
    pub fn mark_healthy(&mut self, latency: Duration, at_ms: i64) -> HealthStatus {
        let previous = self.status;
        self.status = HealthStatus::Healthy;
        self.last_health_check_at_ms = Some(at_ms);
        self.last_latency_ms = Some(latency.as_millis() as u64);
        self.consecutive_failures = 0;
        previous
    }

    /// Apply a failed or timed-out probe. Returns the previous status.
    pub fn mark_unhealthy(&mut self, at_ms: i64) -> HealthStatus {
        let previous = self.status;
        self.status = HealthStatus::Unhealthy;
        self.last_health_check_at_ms = Some(at_ms);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        previous
    }

    /// Count a failed hot-path request. The node is taken out of rotation
    /// once `threshold` consecutive failures accumulate. Returns true when
    /// this call caused the transition.
    pub fn record_request_failure(&mut self, threshold: u32) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.status != HealthStatus::Unhealthy && self.consecutive_failures >= threshold.max(1) {
            self.status = HealthStatus::Unhealthy;
            return true;
        }
        false
    }

    pub fn record_request_success(&mut self) {
        if self.status != HealthStatus::Unhealthy {
            self.consecutive_failures = 0;
        }
    }
}
