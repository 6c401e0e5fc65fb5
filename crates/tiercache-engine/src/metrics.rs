//! Per-strategy cache statistics.
//!
//! Counters are plain atomics so recording never takes a lock beyond the
//! shard read of the strategy map. Every record is also forwarded to the
//! `metrics` facade; the server installs a Prometheus recorder for it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use metrics::{counter, histogram};
use serde::Serialize;

/// Metric names exported through the facade.
pub mod names {
    pub const CACHE_HITS_TOTAL: &str = "cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "cache_misses_total";
    pub const CACHE_SETS_TOTAL: &str = "cache_sets_total";
    pub const CACHE_DELETES_TOTAL: &str = "cache_deletes_total";
    pub const CACHE_ERRORS_TOTAL: &str = "cache_errors_total";
    pub const CACHE_OPERATION_DURATION_SECONDS: &str = "cache_operation_duration_seconds";
}

/// Strategy bucket used for operations that are not tied to a strategy.
pub const DEFAULT_BUCKET: &str = "default";

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
    latency_micros_total: AtomicU64,
    latency_samples: AtomicU64,
}

impl Counters {
    fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.sets,
            &self.deletes,
            &self.errors,
            &self.latency_micros_total,
            &self.latency_samples,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> CacheMetrics {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total_requests = hits + misses;
        let samples = self.latency_samples.load(Ordering::Relaxed);
        let micros = self.latency_micros_total.load(Ordering::Relaxed);

        CacheMetrics {
            hits,
            misses,
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            total_requests,
            average_latency_ms: if samples == 0 {
                0.0
            } else {
                micros as f64 / samples as f64 / 1000.0
            },
            hit_rate: if total_requests == 0 {
                0.0
            } else {
                hits as f64 / total_requests as f64
            },
        }
    }
}

/// Point-in-time statistics for one strategy.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
    /// Read calls: `hits + misses`.
    pub total_requests: u64,
    pub average_latency_ms: f64,
    pub hit_rate: f64,
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Hit,
    Miss,
    Set,
    Delete,
    Error,
}

impl Op {
    fn as_str(self) -> &'static str {
        match self {
            Op::Hit => "hit",
            Op::Miss => "miss",
            Op::Set => "set",
            Op::Delete => "delete",
            Op::Error => "error",
        }
    }
}

#[derive(Debug, Default)]
pub struct MetricsCollector {
    strategies: DashMap<String, Arc<Counters>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self, strategy: &str) -> Arc<Counters> {
        if let Some(existing) = self.strategies.get(strategy) {
            return Arc::clone(existing.value());
        }
        Arc::clone(self.strategies.entry(strategy.to_string()).or_default().value())
    }

    fn record(&self, strategy: &str, op: Op, latency: Option<Duration>) {
        let counters = self.counters(strategy);
        let (counter, name) = match op {
            Op::Hit => (&counters.hits, names::CACHE_HITS_TOTAL),
            Op::Miss => (&counters.misses, names::CACHE_MISSES_TOTAL),
            Op::Set => (&counters.sets, names::CACHE_SETS_TOTAL),
            Op::Delete => (&counters.deletes, names::CACHE_DELETES_TOTAL),
            Op::Error => (&counters.errors, names::CACHE_ERRORS_TOTAL),
        };
        counter.fetch_add(1, Ordering::Relaxed);
        counter!(name, "strategy" => strategy.to_string()).increment(1);

        if let Some(latency) = latency {
            let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
            counters.latency_micros_total.fetch_add(micros, Ordering::Relaxed);
            counters.latency_samples.fetch_add(1, Ordering::Relaxed);
            histogram!(
                names::CACHE_OPERATION_DURATION_SECONDS,
                "strategy" => strategy.to_string(),
                "operation" => op.as_str()
            )
            .record(latency.as_secs_f64());
        }
    }

    pub fn record_hit(&self, strategy: &str, latency: Option<Duration>) {
        self.record(strategy, Op::Hit, latency);
    }

    pub fn record_miss(&self, strategy: &str, latency: Option<Duration>) {
        self.record(strategy, Op::Miss, latency);
    }

    pub fn record_set(&self, strategy: &str, latency: Option<Duration>) {
        self.record(strategy, Op::Set, latency);
    }

    pub fn record_delete(&self, strategy: &str, latency: Option<Duration>) {
        self.record(strategy, Op::Delete, latency);
    }

    pub fn record_error(&self, strategy: &str, latency: Option<Duration>) {
        self.record(strategy, Op::Error, latency);
    }

    /// Statistics for one strategy; zeroes if nothing was recorded for it.
    pub fn snapshot(&self, strategy: &str) -> CacheMetrics {
        self.strategies
            .get(strategy)
            .map(|c| c.snapshot())
            .unwrap_or_default()
    }

    pub fn snapshot_all(&self) -> HashMap<String, CacheMetrics> {
        self.strategies
            .iter()
            .map(|e| (e.key().clone(), e.value().snapshot()))
            .collect()
    }

    /// Zero one strategy's counters, or all of them with `None`.
    pub fn reset(&self, strategy: Option<&str>) {
        match strategy {
            Some(name) => {
                if let Some(counters) = self.strategies.get(name) {
                    counters.reset();
                }
            }
            None => self.strategies.iter().for_each(|e| e.value().reset()),
        }
    }
}
