//! Multi-tier cache engine.
//!
//! A [`CacheEngine`] reads through a primary [`BackingStore`], then healthy
//! peer nodes, then an optional caller-supplied loader. Strategies decide TTL,
//! envelope encoding, warming and invalidation for each family of keys.

pub mod codec;
pub mod config;
pub mod engine;
pub mod health;
pub mod metrics;
pub mod peer;
pub mod store;
pub mod task;
pub mod warmer;

pub use codec::EnvelopeCodec;
pub use config::{EngineConfig, NodeConfig, RedisConfig, StoreBackend, StoreConfig};
pub use engine::{CacheEngine, SetOptions, SweepReport, event_token};
pub use health::{HealthReport, NodeHealthMonitor, NodeRegistry};
pub use metrics::{CacheMetrics, MetricsCollector};
pub use peer::{PeerClient, PeerValue, PeerWrite};
pub use store::{BackingStore, MemoryStore, RedisStore, create_backing_store};
pub use task::{BackgroundTask, BackgroundTasks};
pub use warmer::{CacheWarmer, LiteralKeys, PatternResolver, WarmLoader, WarmReport};

pub use tiercache_core::{
    CacheEntry, CacheError, CacheNode, CacheStrategy, HealthStatus, InvalidationMode, Result,
};
