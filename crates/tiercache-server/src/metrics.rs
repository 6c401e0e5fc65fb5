//! Prometheus export of the cache metrics.
//!
//! The engine records through the `metrics` facade; this module installs the
//! recorder and renders `/metrics`. Node health gauges are refreshed on each
//! scrape.

use metrics::gauge;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use tiercache_core::HealthStatus;
use tiercache_engine::CacheEngine;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub mod names {
    pub const CACHE_NODES: &str = "cache_nodes";
}

/// Initialize the Prometheus metrics exporter.
///
/// Returns `true` if initialization succeeded, `false` if already initialized.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        tracing::debug!("Prometheus metrics already initialized");
        return false;
    }

    // Pull-based: /metrics is served by our own router
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_err() {
                tracing::warn!("Failed to store Prometheus handle (already set)");
                return false;
            }

            tracing::info!("Prometheus metrics initialized");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Prometheus recorder");
            false
        }
    }
}

/// Render all metrics in Prometheus text format.
///
/// Returns `None` if metrics were not initialized.
pub fn render_metrics(engine: &CacheEngine) -> Option<String> {
    let handle = PROMETHEUS_HANDLE.get()?;
    record_node_gauges(engine);
    Some(handle.render())
}

fn record_node_gauges(engine: &CacheEngine) {
    let nodes = engine.nodes();
    for status in [
        HealthStatus::Unknown,
        HealthStatus::Healthy,
        HealthStatus::Unhealthy,
    ] {
        let count = nodes.iter().filter(|n| n.status == status).count();
        gauge!(names::CACHE_NODES, "status" => status.to_string()).set(count as f64);
    }
}
