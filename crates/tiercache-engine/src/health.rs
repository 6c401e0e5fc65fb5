//! Peer node registry and health probing.
//!
//! The registry is the only place node state changes. Probes copy the node
//! out of the map before awaiting, so readers never wait on a probe.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::join_all;
use serde::Serialize;
use tiercache_core::{CacheNode, HealthStatus, now_millis};
use tracing::{debug, info, warn};

use crate::peer::PeerClient;
use crate::task::BackgroundTask;

#[derive(Debug)]
pub struct NodeRegistry {
    nodes: DashMap<String, CacheNode>,
    failure_threshold: u32,
}

impl NodeRegistry {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            nodes: DashMap::new(),
            failure_threshold,
        }
    }

    /// Register or replace a node. Replacing resets its health state.
    pub fn add(&self, node: CacheNode) {
        info!(node_id = %node.id, url = %node.url, region = %node.region, "Peer node registered");
        self.nodes.insert(node.id.clone(), node);
    }

    pub fn remove(&self, id: &str) -> Option<CacheNode> {
        let removed = self.nodes.remove(id).map(|(_, node)| node);
        if removed.is_some() {
            info!(node_id = %id, "Peer node removed");
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<CacheNode> {
        self.nodes.get(id).map(|n| n.value().clone())
    }

    /// All nodes, sorted by id.
    pub fn list(&self) -> Vec<CacheNode> {
        let mut nodes: Vec<CacheNode> = self.nodes.iter().map(|n| n.value().clone()).collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// Nodes eligible for the peer tier, lowest observed latency first.
    /// Nodes never probed sort after measured ones.
    pub fn list_routable(&self) -> Vec<CacheNode> {
        let mut nodes: Vec<CacheNode> = self
            .nodes
            .iter()
            .filter(|n| n.value().is_routable())
            .map(|n| n.value().clone())
            .collect();
        nodes.sort_by(|a, b| {
            let la = a.last_latency_ms.unwrap_or(u64::MAX);
            let lb = b.last_latency_ms.unwrap_or(u64::MAX);
            la.cmp(&lb).then_with(|| a.id.cmp(&b.id))
        });
        nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn record_probe_success(&self, id: &str, latency: Duration) {
        if let Some(mut node) = self.nodes.get_mut(id) {
            let previous = node.mark_healthy(latency, now_millis());
            if previous != HealthStatus::Healthy {
                info!(node_id = %id, from = %previous, latency_ms = latency.as_millis() as u64, "Peer node is healthy");
            }
        }
    }

    pub fn record_probe_failure(&self, id: &str, reason: &str) {
        if let Some(mut node) = self.nodes.get_mut(id) {
            let previous = node.mark_unhealthy(now_millis());
            if previous != HealthStatus::Unhealthy {
                warn!(node_id = %id, from = %previous, reason = %reason, "Peer node is unhealthy");
            }
        }
    }

    /// Count a failed hot-path request against a node.
    pub fn record_peer_failure(&self, id: &str) {
        if let Some(mut node) = self.nodes.get_mut(id)
            && node.record_request_failure(self.failure_threshold)
        {
            warn!(
                node_id = %id,
                consecutive_failures = node.consecutive_failures,
                "Peer node taken out of rotation after repeated failures"
            );
        }
    }

    pub fn record_peer_success(&self, id: &str) {
        if let Some(mut node) = self.nodes.get_mut(id) {
            node.record_request_success();
        }
    }
}

/// Outcome of one probe round.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub healthy: Vec<String>,
    pub unhealthy: Vec<String>,
}

impl HealthReport {
    pub fn total(&self) -> usize {
        self.healthy.len() + self.unhealthy.len()
    }
}

pub struct NodeHealthMonitor {
    registry: Arc<NodeRegistry>,
    client: PeerClient,
    interval: Duration,
}

impl NodeHealthMonitor {
    pub fn new(registry: Arc<NodeRegistry>, client: PeerClient, interval: Duration) -> Self {
        Self {
            registry,
            client,
            interval,
        }
    }

    /// Probe every registered node concurrently and apply the results.
    pub async fn probe_all(&self) -> HealthReport {
        let nodes = self.registry.list();
        let results = join_all(nodes.iter().map(|node| async move {
            (node.id.clone(), self.client.probe(node).await)
        }))
        .await;

        let mut report = HealthReport::default();
        for (id, result) in results {
            match result {
                Ok(latency) => {
                    self.registry.record_probe_success(&id, latency);
                    report.healthy.push(id);
                }
                Err(e) => {
                    self.registry.record_probe_failure(&id, &e.to_string());
                    report.unhealthy.push(id);
                }
            }
        }

        debug!(
            healthy = report.healthy.len(),
            unhealthy = report.unhealthy.len(),
            "Health probe round complete"
        );
        report
    }

    /// Run `probe_all` periodically until the returned task is stopped.
    pub fn start(self: Arc<Self>) -> BackgroundTask {
        let period = self.interval;
        BackgroundTask::spawn("node-health", period, move || {
            let monitor = Arc::clone(&self);
            async move {
                monitor.probe_all().await;
            }
        })
    }
}
