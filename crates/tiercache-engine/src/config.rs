use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tiercache_core::{CacheNode, CacheStrategy};

/// Engine configuration supplied by the embedding application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Per-peer read timeout for the secondary tier
    #[serde(default = "default_peer_read_timeout_ms")]
    pub peer_read_timeout_ms: u64,

    /// Per-peer write/delete timeout for fan-out
    #[serde(default = "default_peer_write_timeout_ms")]
    pub peer_write_timeout_ms: u64,

    /// Timeout of a single `GET /health` probe
    #[serde(default = "default_health_probe_timeout_ms")]
    pub health_probe_timeout_ms: u64,

    #[serde(default = "default_store_read_timeout_ms")]
    pub store_read_timeout_ms: u64,

    #[serde(default = "default_store_write_timeout_ms")]
    pub store_write_timeout_ms: u64,

    /// Bound on caller-supplied fallback and warming loaders
    #[serde(default = "default_loader_timeout_ms")]
    pub loader_timeout_ms: u64,

    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,

    #[serde(default = "default_warming_interval_secs")]
    pub warming_interval_secs: u64,

    /// Period of the sweep that purges expired entries and their dependency edges
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Consecutive hot-path failures before a peer is taken out of rotation
    #[serde(default = "default_peer_failure_threshold")]
    pub peer_failure_threshold: u32,

    /// Maximum peers consulted by a single read
    #[serde(default = "default_max_peer_reads")]
    pub max_peer_reads: usize,

    /// 32-byte AES-256 key, hex or base64, required by strategies with `encryption = true`
    #[serde(default)]
    pub encryption_key: Option<String>,

    #[serde(default)]
    pub store: StoreConfig,

    /// Strategies registered at startup
    #[serde(default)]
    pub strategies: HashMap<String, CacheStrategy>,

    /// Peer nodes registered at startup
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

fn default_peer_read_timeout_ms() -> u64 {
    1_000
}
fn default_peer_write_timeout_ms() -> u64 {
    5_000
}
fn default_health_probe_timeout_ms() -> u64 {
    5_000
}
fn default_store_read_timeout_ms() -> u64 {
    1_000
}
fn default_store_write_timeout_ms() -> u64 {
    5_000
}
fn default_loader_timeout_ms() -> u64 {
    5_000
}
fn default_health_check_interval_secs() -> u64 {
    30
}
fn default_warming_interval_secs() -> u64 {
    300 // 5 minutes
}
fn default_sweep_interval_ms() -> u64 {
    60_000
}
fn default_peer_failure_threshold() -> u32 {
    3
}
fn default_max_peer_reads() -> usize {
    3
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            peer_read_timeout_ms: default_peer_read_timeout_ms(),
            peer_write_timeout_ms: default_peer_write_timeout_ms(),
            health_probe_timeout_ms: default_health_probe_timeout_ms(),
            store_read_timeout_ms: default_store_read_timeout_ms(),
            store_write_timeout_ms: default_store_write_timeout_ms(),
            loader_timeout_ms: default_loader_timeout_ms(),
            health_check_interval_secs: default_health_check_interval_secs(),
            warming_interval_secs: default_warming_interval_secs(),
            sweep_interval_ms: default_sweep_interval_ms(),
            peer_failure_threshold: default_peer_failure_threshold(),
            max_peer_reads: default_max_peer_reads(),
            encryption_key: None,
            store: StoreConfig::default(),
            strategies: HashMap::new(),
            nodes: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), String> {
        let timeouts = [
            ("peer_read_timeout_ms", self.peer_read_timeout_ms),
            ("peer_write_timeout_ms", self.peer_write_timeout_ms),
            ("health_probe_timeout_ms", self.health_probe_timeout_ms),
            ("store_read_timeout_ms", self.store_read_timeout_ms),
            ("store_write_timeout_ms", self.store_write_timeout_ms),
            ("loader_timeout_ms", self.loader_timeout_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(format!("engine.{name} must be > 0"));
            }
        }
        if self.health_check_interval_secs == 0
            || self.warming_interval_secs == 0
            || self.sweep_interval_ms == 0
        {
            return Err("engine background intervals must be > 0".into());
        }
        if self.store.default_ttl_secs == 0 {
            return Err("engine.store.default_ttl_secs must be > 0".into());
        }
        if self.store.backend == StoreBackend::Redis && self.store.redis.url.is_empty() {
            return Err("engine.store.redis.url must not be empty".into());
        }
        for (name, strategy) in &self.strategies {
            strategy.validate(name).map_err(|e| e.to_string())?;
            if strategy.encryption && self.encryption_key.is_none() {
                return Err(format!(
                    "strategy '{name}' requires encryption but engine.encryption_key is not set"
                ));
            }
        }
        for node in &self.nodes {
            if node.id.is_empty() || node.url.is_empty() {
                return Err("engine.nodes entries require both 'id' and 'url'".into());
            }
        }
        Ok(())
    }

    pub fn peer_read_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_read_timeout_ms)
    }
    pub fn peer_write_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_write_timeout_ms)
    }
    pub fn health_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.health_probe_timeout_ms)
    }
    pub fn store_read_timeout(&self) -> Duration {
        Duration::from_millis(self.store_read_timeout_ms)
    }
    pub fn store_write_timeout(&self) -> Duration {
        Duration::from_millis(self.store_write_timeout_ms)
    }
    pub fn loader_timeout(&self) -> Duration {
        Duration::from_millis(self.loader_timeout_ms)
    }
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
    pub fn warming_interval(&self) -> Duration {
        Duration::from_secs(self.warming_interval_secs)
    }
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process map, single node
    #[default]
    Memory,
    Redis,
}

/// Backing store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// TTL applied when a strategy declares `ttl_seconds = 0`
    #[serde(default = "default_store_ttl_secs")]
    pub default_ttl_secs: u64,

    #[serde(default)]
    pub redis: RedisConfig,
}

fn default_store_ttl_secs() -> u64 {
    3600 // 1 hour
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            default_ttl_secs: default_store_ttl_secs(),
            redis: RedisConfig::default(),
        }
    }
}

impl StoreConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL (e.g., "redis://localhost:6379")
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Connection timeout in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_redis_pool_size() -> usize {
    10
}

fn default_redis_timeout_ms() -> u64 {
    5000
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
        }
    }
}

/// Static peer declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub region: String,
}

impl From<&NodeConfig> for CacheNode {
    fn from(cfg: &NodeConfig) -> Self {
        CacheNode::new(&cfg.id, &cfg.url, &cfg.region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = EngineConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.peer_read_timeout(), Duration::from_secs(1));
        assert_eq!(cfg.peer_write_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.health_check_interval(), Duration::from_secs(30));
        assert_eq!(cfg.warming_interval(), Duration::from_secs(300));
        assert_eq!(cfg.sweep_interval(), Duration::from_secs(60));
        assert_eq!(cfg.store.backend, StoreBackend::Memory);
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let cfg = EngineConfig {
            peer_read_timeout_ms: 0,
            ..EngineConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.contains("peer_read_timeout_ms"));
    }

    #[test]
    fn test_encrypted_strategy_requires_key() {
        let mut cfg = EngineConfig::default();
        cfg.strategies
            .insert("secret".into(), CacheStrategy::with_ttl(60).encrypted());
        assert!(cfg.validate().is_err());

        cfg.encryption_key = Some("00".repeat(32));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_deserialize_partial_config() {
        let cfg: EngineConfig = serde_json::from_value(serde_json::json!({
            "peer_read_timeout_ms": 250,
            "store": { "backend": "redis", "redis": { "url": "redis://cache:6379" } },
            "strategies": { "user": { "ttl_seconds": 2 } },
            "nodes": [{ "id": "b", "url": "http://peer-b:7400" }]
        }))
        .unwrap();

        assert_eq!(cfg.peer_read_timeout_ms, 250);
        assert_eq!(cfg.peer_write_timeout_ms, 5_000);
        assert_eq!(cfg.store.backend, StoreBackend::Redis);
        assert_eq!(cfg.store.redis.pool_size, 10);
        assert_eq!(cfg.strategies["user"].ttl_seconds, 2);
        assert_eq!(CacheNode::from(&cfg.nodes[0]).url, "http://peer-b:7400");
    }
}
