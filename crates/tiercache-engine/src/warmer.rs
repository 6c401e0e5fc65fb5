//! Proactive population of strategies that declare `warming.enabled`.
//!
//! Callers register a [`PatternResolver`] and a [`WarmLoader`] per strategy.
//! A warming run resolves the strategy's source patterns to keys, loads each
//! key and writes it through the normal `set` path. Keys are isolated from
//! each other: one failing load never aborts the rest of the run.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::join_all;
use serde::Serialize;
use tiercache_core::{CacheError, Result};
use tracing::{debug, info, warn};

use crate::engine::CacheEngine;

/// Expands a strategy's source patterns into concrete cache keys.
#[async_trait]
pub trait PatternResolver: Send + Sync {
    async fn resolve(&self, patterns: &[String]) -> Result<Vec<String>>;
}

/// Produces the value to cache for a key.
#[async_trait]
pub trait WarmLoader: Send + Sync {
    async fn load(&self, key: &str) -> Result<serde_json::Value>;
}

/// Resolver that treats every pattern as a literal key.
#[derive(Debug, Clone, Copy, Default)]
pub struct LiteralKeys;

#[async_trait]
impl PatternResolver for LiteralKeys {
    async fn resolve(&self, patterns: &[String]) -> Result<Vec<String>> {
        Ok(patterns.to_vec())
    }
}

/// Outcome of warming one strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WarmReport {
    pub strategy: String,
    pub resolved: usize,
    pub warmed: usize,
    pub failed: usize,
}

#[derive(Clone)]
struct WarmSource {
    resolver: Arc<dyn PatternResolver>,
    loader: Arc<dyn WarmLoader>,
}

pub struct CacheWarmer {
    sources: DashMap<String, WarmSource>,
    last_run: DashMap<String, Instant>,
    loader_timeout: Duration,
}

impl CacheWarmer {
    pub fn new(loader_timeout: Duration) -> Self {
        Self {
            sources: DashMap::new(),
            last_run: DashMap::new(),
            loader_timeout,
        }
    }

    pub fn register(
        &self,
        strategy: impl Into<String>,
        resolver: Arc<dyn PatternResolver>,
        loader: Arc<dyn WarmLoader>,
    ) {
        let strategy = strategy.into();
        debug!(strategy = %strategy, "warming source registered");
        self.sources.insert(strategy, WarmSource { resolver, loader });
    }

    pub fn unregister(&self, strategy: &str) -> bool {
        self.last_run.remove(strategy);
        self.sources.remove(strategy).is_some()
    }

    pub fn has_source(&self, strategy: &str) -> bool {
        self.sources.contains_key(strategy)
    }

    /// Warm one strategy now, regardless of its schedule.
    pub async fn warm(&self, engine: &CacheEngine, strategy: &str) -> Result<WarmReport> {
        let policy = engine.strategy(strategy)?;
        let source = self
            .sources
            .get(strategy)
            .map(|s| s.value().clone())
            .ok_or_else(|| {
                CacheError::loader(format!("no warming source registered for strategy '{strategy}'"))
            })?;
        self.last_run.insert(strategy.to_string(), Instant::now());

        let keys = source
            .resolver
            .resolve(&policy.warming.source_patterns)
            .await?;

        let results = join_all(
            keys.iter()
                .map(|key| self.warm_key(engine, &source, strategy, key)),
        )
        .await;

        let warmed = results.iter().filter(|ok| **ok).count();
        let report = WarmReport {
            strategy: strategy.to_string(),
            resolved: keys.len(),
            warmed,
            failed: keys.len() - warmed,
        };
        info!(
            strategy = %strategy,
            resolved = report.resolved,
            warmed = report.warmed,
            failed = report.failed,
            "Cache warming complete"
        );
        Ok(report)
    }

    async fn warm_key(
        &self,
        engine: &CacheEngine,
        source: &WarmSource,
        strategy: &str,
        key: &str,
    ) -> bool {
        let loaded = match tokio::time::timeout(self.loader_timeout, source.loader.load(key)).await {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                warn!(strategy = %strategy, key = %key, error = %e, "Warming load failed");
                return false;
            }
            Err(_) => {
                warn!(strategy = %strategy, key = %key, "Warming load timed out");
                return false;
            }
        };

        match engine.set(key, &loaded, strategy).await {
            Ok(()) => true,
            Err(e) => {
                warn!(strategy = %strategy, key = %key, error = %e, "Warming write failed");
                false
            }
        }
    }

    /// Warm every warming-enabled strategy that has a source.
    pub async fn warm_all(&self, engine: &CacheEngine) -> Vec<WarmReport> {
        self.run(engine, false).await
    }

    /// Warm the strategies whose own schedule interval has elapsed.
    pub async fn warm_due(&self, engine: &CacheEngine) -> Vec<WarmReport> {
        self.run(engine, true).await
    }

    async fn run(&self, engine: &CacheEngine, honor_schedule: bool) -> Vec<WarmReport> {
        let mut reports = Vec::new();
        for (name, policy) in engine.strategies().warming_enabled() {
            if !self.has_source(&name) {
                debug!(strategy = %name, "warming enabled but no source registered, skipping");
                continue;
            }
            if honor_schedule && !self.is_due(&name, policy.warming.schedule_interval_seconds) {
                continue;
            }
            match self.warm(engine, &name).await {
                Ok(report) => reports.push(report),
                Err(e) => warn!(strategy = %name, error = %e, "Cache warming failed"),
            }
        }
        reports
    }

    fn is_due(&self, strategy: &str, interval_seconds: u64) -> bool {
        match self.last_run.get(strategy) {
            Some(last) => last.elapsed() >= Duration::from_secs(interval_seconds),
            None => true,
        }
    }
}
