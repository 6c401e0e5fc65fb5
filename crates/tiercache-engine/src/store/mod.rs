//! Primary tier: the authoritative key-value store behind the engine.
//!
//! ## Adapters
//!
//! - **Memory**: per-process `DashMap` with per-key expiry, single node
//! - **Redis**: shared store through a `deadpool-redis` pool
//!
//! If Redis is configured but unreachable at startup, [`create_backing_store`]
//! falls back to the memory adapter so the node still serves traffic.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tiercache_core::Result;

use crate::config::{StoreBackend, StoreConfig};

pub mod memory;
pub mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// Authoritative key-value store consulted as the primary tier.
///
/// Implementations must be idempotent and leave no partial state behind on
/// failure: a failed `get` reports an error, never a truncated value.
#[async_trait]
pub trait BackingStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Remaining time to live, `None` when the key is absent.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;

    /// Values for the keys that are present; absent keys are omitted.
    async fn multi_get(&self, keys: &[String]) -> Result<HashMap<String, Vec<u8>>>;

    /// Store all entries with one TTL (`None` applies the store default).
    async fn multi_set(&self, entries: HashMap<String, Vec<u8>>, ttl: Option<Duration>) -> Result<()>;

    /// Replace the value only if the key still holds exactly `expected`.
    /// Returns false, writing nothing, when the key changed or is gone.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: &[u8],
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool>;

    /// Delete the key only if it still holds exactly `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool>;

    /// Write the value only if the key is absent.
    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool>;

    /// Drop expired keys the store does not evict by itself. Returns how many
    /// were removed.
    fn purge_expired(&self) -> usize {
        0
    }

    /// TTL used when a strategy declares `ttl_seconds = 0`.
    fn default_ttl(&self) -> Duration;

    /// Short adapter name for logs and stats.
    fn kind(&self) -> &'static str;
}

/// Build the configured backing store.
pub async fn create_backing_store(config: &StoreConfig) -> Arc<dyn BackingStore> {
    match config.backend {
        StoreBackend::Memory => {
            tracing::info!("Using in-memory backing store");
            Arc::new(MemoryStore::new(config.default_ttl()))
        }
        StoreBackend::Redis => match RedisStore::connect(&config.redis, config.default_ttl()).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "Failed to connect to Redis. Falling back to in-memory backing store."
                );
                Arc::new(MemoryStore::new(config.default_ttl()))
            }
        },
    }
}
