use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::{elapsed_since, now_millis};

/// Envelope placed around every cached value.
///
/// `ttl_seconds` is the TTL actually applied at write time. Read-time
/// validity is evaluated against whatever TTL the caller passes in, which is
/// the current strategy TTL when the strategy is known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub data: T,
    pub written_at_ms: i64,
    pub ttl_seconds: u64,
    #[serde(default)]
    pub hit_count: u64,
    /// Strategy the entry was written under; absent for peer-pushed entries.
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl<T> CacheEntry<T> {
    pub fn new(data: T, ttl: Duration) -> Self {
        Self {
            data,
            written_at_ms: now_millis(),
            ttl_seconds: ttl.as_secs(),
            hit_count: 0,
            strategy: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = Some(strategy.into());
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// The TTL recorded on the entry.
    pub fn own_ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn age_at(&self, now_ms: i64) -> Duration {
        elapsed_since(self.written_at_ms, now_ms)
    }

    /// `now - written_at < ttl`.
    pub fn is_valid_at(&self, now_ms: i64, effective_ttl: Duration) -> bool {
        self.age_at(now_ms) < effective_ttl
    }

    pub fn is_valid(&self, effective_ttl: Duration) -> bool {
        self.is_valid_at(now_millis(), effective_ttl)
    }

    /// Time left before the entry becomes invalid under `effective_ttl`.
    pub fn remaining_at(&self, now_ms: i64, effective_ttl: Duration) -> Duration {
        effective_ttl.saturating_sub(self.age_at(now_ms))
    }

    pub fn record_hit(&mut self) {
        self.hit_count = self.hit_count.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_written_at(written_at_ms: i64, ttl_secs: u64) -> CacheEntry<&'static str> {
        CacheEntry {
            data: "value",
            written_at_ms,
            ttl_seconds: ttl_secs,
            hit_count: 0,
            strategy: None,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_validity_boundaries() {
        let entry = entry_written_at(10_000, 2);
        let ttl = entry.own_ttl();

        assert!(entry.is_valid_at(10_000, ttl));
        assert!(entry.is_valid_at(11_999, ttl));
        assert!(!entry.is_valid_at(12_000, ttl));
        assert!(!entry.is_valid_at(15_000, ttl));
    }

    #[test]
    fn test_validity_uses_supplied_ttl() {
        let entry = entry_written_at(10_000, 60);

        // A shortened strategy TTL invalidates the entry early.
        assert!(!entry.is_valid_at(12_500, Duration::from_secs(2)));
        assert!(entry.is_valid_at(12_500, entry.own_ttl()));
    }

    #[test]
    fn test_remaining() {
        let entry = entry_written_at(10_000, 5);
        assert_eq!(
            entry.remaining_at(12_000, entry.own_ttl()),
            Duration::from_secs(3)
        );
        assert_eq!(entry.remaining_at(20_000, entry.own_ttl()), Duration::ZERO);
    }

    #[test]
    fn test_record_hit() {
        let mut entry = CacheEntry::new(21, Duration::from_secs(30)).with_strategy("numbers");
        entry.record_hit();
        entry.record_hit();

        assert_eq!(entry.data, 21);
        assert_eq!(entry.hit_count, 2);
        assert_eq!(entry.strategy.as_deref(), Some("numbers"));
        assert_eq!(entry.ttl_seconds, 30);
    }
}
