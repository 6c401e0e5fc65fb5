//! Redis backing store.

use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Connection, Pool};
use redis::{AsyncCommands, Script};
use tiercache_core::{CacheError, Result};

use super::BackingStore;
use crate::config::RedisConfig;

/// Redis-backed primary tier.
///
/// TTLs are applied with millisecond precision (`PSETEX`/`PTTL`).
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
    default_ttl: Duration,
}

impl RedisStore {
    /// Wrap an existing pool.
    pub fn new(pool: Pool, default_ttl: Duration) -> Self {
        Self { pool, default_ttl }
    }

    /// Create a pool from configuration and verify a connection can be made.
    pub async fn connect(config: &RedisConfig, default_ttl: Duration) -> Result<Self> {
        tracing::info!(url = %config.url, "Connecting to Redis");

        let mut redis_config = deadpool_redis::Config::from_url(&config.url);
        let timeout = Duration::from_millis(config.timeout_ms);
        let pool_config = redis_config
            .pool
            .get_or_insert_with(|| deadpool_redis::PoolConfig::new(config.pool_size));
        pool_config.max_size = config.pool_size;
        pool_config.timeouts.wait = Some(timeout);
        pool_config.timeouts.create = Some(timeout);
        pool_config.timeouts.recycle = Some(timeout);

        let pool = redis_config
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .map_err(|e| CacheError::backing_store(format!("failed to create Redis pool: {e}")))?;

        // Test connection
        pool.get()
            .await
            .map_err(|e| CacheError::backing_store(format!("failed to connect to Redis: {e}")))?;

        tracing::info!("Connected to Redis");
        Ok(Self::new(pool, default_ttl))
    }

    async fn conn(&self) -> Result<Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| CacheError::backing_store(format!("failed to get Redis connection: {e}")))
    }
}

/// KEYS[1] = key, ARGV[1] = expected bytes, ARGV[2] = ttl millis, ARGV[3] = new bytes
static COMPARE_AND_SET: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            redis.call('PSETEX', KEYS[1], ARGV[2], ARGV[3])
            return 1
        end
        return 0
        ",
    )
});

/// KEYS[1] = key, ARGV[1] = expected bytes
static COMPARE_AND_DELETE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('DEL', KEYS[1])
        end
        return 0
        ",
    )
});

fn command_error(op: &str, key: &str, e: redis::RedisError) -> CacheError {
    CacheError::backing_store(format!("Redis {op} '{key}' failed: {e}"))
}

/// Redis rejects a zero PSETEX expiry; round sub-millisecond TTLs up.
fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl BackingStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;
        conn.get::<_, Option<Vec<u8>>>(key)
            .await
            .map_err(|e| command_error("GET", key, e))
    }

    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.pset_ex::<_, _, ()>(key, value, ttl_millis(ttl))
            .await
            .map_err(|e| command_error("PSETEX", key, e))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(key)
            .await
            .map_err(|e| command_error("DEL", key, e))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        conn.exists::<_, bool>(key)
            .await
            .map_err(|e| command_error("EXISTS", key, e))
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.conn().await?;
        let millis: i64 = conn
            .pttl(key)
            .await
            .map_err(|e| command_error("PTTL", key, e))?;
        // -2: missing key, -1: key without expiry
        Ok(match millis {
            -2 => None,
            -1 => Some(Duration::MAX),
            ms => Some(Duration::from_millis(ms.max(0) as u64)),
        })
    }

    async fn multi_get(&self, keys: &[String]) -> Result<HashMap<String, Vec<u8>>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("MGET");
        for key in keys {
            cmd.arg(key);
        }
        let values: Vec<Option<Vec<u8>>> = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("MGET", &keys.join(","), e))?;

        Ok(keys
            .iter()
            .zip(values)
            .filter_map(|(key, value)| value.map(|v| (key.clone(), v)))
            .collect())
    }

    async fn multi_set(&self, entries: HashMap<String, Vec<u8>>, ttl: Option<Duration>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let millis = ttl_millis(ttl.unwrap_or(self.default_ttl));
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, value) in &entries {
            pipe.cmd("PSETEX").arg(key).arg(millis).arg(value).ignore();
        }

        let mut conn = self.conn().await?;
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::backing_store(format!("Redis pipeline PSETEX failed: {e}")))?;
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &[u8],
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool> {
        let mut conn = self.conn().await?;
        let swapped: i64 = COMPARE_AND_SET
            .key(key)
            .arg(expected)
            .arg(ttl_millis(ttl))
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| command_error("compare-and-set", key, e))?;
        Ok(swapped == 1)
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let mut conn = self.conn().await?;
        let deleted: i64 = COMPARE_AND_DELETE
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| command_error("compare-and-delete", key, e))?;
        Ok(deleted == 1)
    }

    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .arg("NX")
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("SET NX", key, e))?;
        Ok(reply.is_some())
    }

    fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    fn kind(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_millis_never_zero() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_micros(500)), 1);
        assert_eq!(ttl_millis(Duration::from_secs(2)), 2_000);
    }
}
