//! In-process backing store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tiercache_core::Result;

use super::BackingStore;

/// A stored value with its own expiry.
///
/// The bytes are wrapped in `Arc` so hits clone a pointer, not the payload.
#[derive(Clone, Debug)]
struct StoredValue {
    data: Arc<Vec<u8>>,
    expires_at: Instant,
}

impl StoredValue {
    fn new(data: Vec<u8>, ttl: Duration) -> Self {
        Self {
            data: Arc::new(data),
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// `DashMap`-backed store for single-node deployments and tests.
#[derive(Clone, Debug)]
pub struct MemoryStore {
    map: Arc<DashMap<String, StoredValue>>,
    default_ttl: Duration,
}

impl MemoryStore {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            map: Arc::new(DashMap::new()),
            default_ttl,
        }
    }

    /// Number of stored keys, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn live(&self, key: &str) -> Option<StoredValue> {
        let entry = self.map.get(key)?;
        if entry.is_expired() {
            drop(entry);
            self.map.remove_if(key, |_, v| v.is_expired());
            return None;
        }
        Some(entry.value().clone())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

#[async_trait]
impl BackingStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.live(key).map(|v| v.data.as_ref().clone()))
    }

    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.map.insert(key.to_string(), StoredValue::new(value, ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.map.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.live(key).is_some())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        Ok(self
            .live(key)
            .map(|v| v.expires_at.saturating_duration_since(Instant::now())))
    }

    async fn multi_get(&self, keys: &[String]) -> Result<HashMap<String, Vec<u8>>> {
        Ok(keys
            .iter()
            .filter_map(|k| self.live(k).map(|v| (k.clone(), v.data.as_ref().clone())))
            .collect())
    }

    async fn multi_set(&self, entries: HashMap<String, Vec<u8>>, ttl: Option<Duration>) -> Result<()> {
        let ttl = ttl.unwrap_or(self.default_ttl);
        for (key, value) in entries {
            self.map.insert(key, StoredValue::new(value, ttl));
        }
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &[u8],
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool> {
        // The shard stays write-locked until `current` is dropped.
        let Some(mut current) = self.map.get_mut(key) else {
            return Ok(false);
        };
        if current.is_expired() || current.data.as_slice() != expected {
            return Ok(false);
        }
        *current = StoredValue::new(value, ttl);
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool> {
        Ok(self
            .map
            .remove_if(key, |_, v| v.data.as_slice() == expected)
            .is_some())
    }

    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool> {
        match self.map.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_expired() {
                    return Ok(false);
                }
                occupied.insert(StoredValue::new(value, ttl));
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue::new(value, ttl));
                Ok(true)
            }
        }
    }

    fn purge_expired(&self) -> usize {
        let before = self.map.len();
        self.map.retain(|_, v| !v.is_expired());
        before.saturating_sub(self.map.len())
    }

    fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_set_delete() {
        let store = MemoryStore::default();
        store
            .set_with_ttl("k", b"v".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert!(store.exists("k").await.unwrap());

        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
        // Deleting again is a no-op
        store.delete("k").await.unwrap();
    }

    #[tokio::test]
    async fn test_expiration() {
        let store = MemoryStore::default();
        store
            .set_with_ttl("short", b"v".to_vec(), Duration::from_millis(50))
            .await
            .unwrap();
        assert!(store.get("short").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(store.get("short").await.unwrap().is_none());
        assert!(!store.exists("short").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_ttl_reports_remaining() {
        let store = MemoryStore::default();
        store
            .set_with_ttl("k", b"v".to_vec(), Duration::from_secs(10))
            .await
            .unwrap();

        let remaining = store.ttl("k").await.unwrap().unwrap();
        assert!(remaining <= Duration::from_secs(10));
        assert!(remaining > Duration::from_secs(9));
        assert_eq!(store.ttl("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_multi_get_and_set() {
        let store = MemoryStore::new(Duration::from_secs(30));
        let entries = HashMap::from([
            ("a".to_string(), b"1".to_vec()),
            ("b".to_string(), b"2".to_vec()),
        ]);
        store.multi_set(entries, None).await.unwrap();

        let found = store
            .multi_get(&["a".to_string(), "b".to_string(), "c".to_string()])
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found["a"], b"1".to_vec());
        assert!(!found.contains_key("c"));

        let remaining = store.ttl("a").await.unwrap().unwrap();
        assert!(remaining > Duration::from_secs(29));
    }

    #[tokio::test]
    async fn test_compare_and_set_requires_unchanged_value() {
        let store = MemoryStore::default();
        let ttl = Duration::from_secs(60);
        store.set_with_ttl("k", b"v1".to_vec(), ttl).await.unwrap();

        assert!(store.compare_and_set("k", b"v1", b"v1+".to_vec(), ttl).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some(b"v1+".to_vec()));

        // Stale expectation leaves the newer value alone
        assert!(!store.compare_and_set("k", b"v1", b"old".to_vec(), ttl).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some(b"v1+".to_vec()));

        // A deleted key is not recreated
        store.delete("k").await.unwrap();
        assert!(!store.compare_and_set("k", b"v1+", b"again".to_vec(), ttl).await.unwrap());
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_compare_and_delete() {
        let store = MemoryStore::default();
        let ttl = Duration::from_secs(60);
        store.set_with_ttl("k", b"new".to_vec(), ttl).await.unwrap();

        assert!(!store.compare_and_delete("k", b"old").await.unwrap());
        assert!(store.exists("k").await.unwrap());
        assert!(store.compare_and_delete("k", b"new").await.unwrap());
        assert!(!store.exists("k").await.unwrap());
        assert!(!store.compare_and_delete("k", b"new").await.unwrap());
    }

    #[tokio::test]
    async fn test_set_if_absent() {
        let store = MemoryStore::default();
        let ttl = Duration::from_secs(60);
        assert!(store.set_if_absent("k", b"first".to_vec(), ttl).await.unwrap());
        assert!(!store.set_if_absent("k", b"second".to_vec(), ttl).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some(b"first".to_vec()));

        // Expired keys count as absent
        store
            .set_with_ttl("short", b"v".to_vec(), Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.set_if_absent("short", b"fresh".to_vec(), ttl).await.unwrap());
        assert_eq!(store.get("short").await.unwrap(), Some(b"fresh".to_vec()));
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = MemoryStore::default();
        store
            .set_with_ttl("gone", b"v".to_vec(), Duration::from_millis(10))
            .await
            .unwrap();
        store
            .set_with_ttl("kept", b"v".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }
}
