//! Named cache strategies and the registry that resolves them.
//!
//! A strategy bundles the TTL, warming and invalidation policy applied to a
//! family of keys. Strategies are immutable once registered; registering the
//! same name again replaces the previous definition for subsequent reads.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

/// TTL applied when a caller names a strategy that was never registered.
pub const DEFAULT_TTL_SECONDS: i64 = 300;

/// How entries written under a strategy are invalidated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidationMode {
    /// Entries expire by TTL only.
    #[default]
    Time,
    /// Entries are registered against dependency tokens and pushed to peers.
    Dependency,
    /// Entries are registered against named events.
    Event,
    /// Entries are only removed by explicit deletes.
    Manual,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WarmingConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Patterns handed to the caller-supplied resolver.
    #[serde(default)]
    pub source_patterns: Vec<String>,
    /// Minimum seconds between two warming runs; 0 warms on every scheduler tick.
    #[serde(default)]
    pub schedule_interval_seconds: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvalidationConfig {
    #[serde(default)]
    pub mode: InvalidationMode,
    #[serde(default)]
    pub dependency_tokens: Vec<String>,
    #[serde(default)]
    pub event_names: Vec<String>,
}

/// Policy for a family of cache keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStrategy {
    /// TTL in seconds. 0 defers to the backing store's default TTL.
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: i64,
    /// Advisory size hint, not enforced by the engine.
    #[serde(default)]
    pub max_entries: Option<usize>,
    #[serde(default)]
    pub compression: bool,
    #[serde(default)]
    pub encryption: bool,
    #[serde(default)]
    pub warming: WarmingConfig,
    #[serde(default)]
    pub invalidation: InvalidationConfig,
}

fn default_ttl_seconds() -> i64 {
    DEFAULT_TTL_SECONDS
}

impl Default for CacheStrategy {
    fn default() -> Self {
        Self {
            ttl_seconds: default_ttl_seconds(),
            max_entries: None,
            compression: false,
            encryption: false,
            warming: WarmingConfig::default(),
            invalidation: InvalidationConfig::default(),
        }
    }
}

impl CacheStrategy {
    /// Create a time-invalidated strategy with the given TTL.
    pub fn with_ttl(ttl_seconds: i64) -> Self {
        Self {
            ttl_seconds,
            ..Self::default()
        }
    }

    pub fn compressed(mut self) -> Self {
        self.compression = true;
        self
    }

    pub fn encrypted(mut self) -> Self {
        self.encryption = true;
        self
    }

    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = Some(max);
        self
    }

    /// Enable warming for the given source patterns.
    pub fn with_warming(mut self, patterns: Vec<String>, interval_seconds: u64) -> Self {
        self.warming = WarmingConfig {
            enabled: true,
            source_patterns: patterns,
            schedule_interval_seconds: interval_seconds,
        };
        self
    }

    /// Switch to dependency invalidation with strategy-wide tokens.
    pub fn with_dependencies(mut self, tokens: Vec<String>) -> Self {
        self.invalidation.mode = InvalidationMode::Dependency;
        self.invalidation.dependency_tokens = tokens;
        self
    }

    /// Switch to event invalidation for the given event names.
    pub fn with_events(mut self, events: Vec<String>) -> Self {
        self.invalidation.mode = InvalidationMode::Event;
        self.invalidation.event_names = events;
        self
    }

    pub fn manual(mut self) -> Self {
        self.invalidation.mode = InvalidationMode::Manual;
        self
    }

    /// Effective TTL, resolving 0 to the backing store's default.
    pub fn effective_ttl(&self, store_default: Duration) -> Duration {
        if self.ttl_seconds <= 0 {
            store_default
        } else {
            Duration::from_secs(self.ttl_seconds as u64)
        }
    }

    pub fn validate(&self, name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(CacheError::invalid_strategy(name, "name must not be empty"));
        }
        if self.ttl_seconds < 0 {
            return Err(CacheError::invalid_strategy(
                name,
                format!("ttl_seconds must be >= 0, got {}", self.ttl_seconds),
            ));
        }
        Ok(())
    }
}

/// Concurrent name -> strategy map.
#[derive(Debug, Default)]
pub struct StrategyRegistry {
    strategies: DashMap<String, Arc<CacheStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store or replace a strategy.
    pub fn register(&self, name: impl Into<String>, strategy: CacheStrategy) -> Result<()> {
        let name = name.into();
        strategy.validate(&name)?;
        tracing::debug!(strategy = %name, ttl_seconds = strategy.ttl_seconds, "strategy registered");
        self.strategies.insert(name, Arc::new(strategy));
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<CacheStrategy>> {
        self.strategies
            .get(name)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| CacheError::strategy_not_found(name))
    }

    /// Resolve a strategy, falling back to the hard-coded default when the
    /// name is unknown. The boolean reports whether the name was known.
    pub fn resolve_or_default(&self, name: &str) -> (Arc<CacheStrategy>, bool) {
        match self.resolve(name) {
            Ok(strategy) => (strategy, true),
            Err(_) => {
                tracing::debug!(strategy = %name, "unknown strategy, using defaults");
                (Arc::new(CacheStrategy::default()), false)
            }
        }
    }

    pub fn remove(&self, name: &str) -> Option<Arc<CacheStrategy>> {
        self.strategies.remove(name).map(|(_, s)| s)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.strategies.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.strategies.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Strategies with warming enabled, sorted by name.
    pub fn warming_enabled(&self) -> Vec<(String, Arc<CacheStrategy>)> {
        let mut out: Vec<_> = self
            .strategies
            .iter()
            .filter(|e| e.value().warming.enabled)
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}
