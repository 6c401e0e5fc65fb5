pub mod clock;
pub mod dependency;
pub mod entry;
pub mod error;
pub mod node;
pub mod strategy;

pub use clock::now_millis;
pub use dependency::{CascadeOutcome, DependencyGraph};
pub use entry::CacheEntry;
pub use error::{CacheError, ErrorCategory, Result};
pub use node::{CacheNode, HealthStatus};
pub use strategy::{
    CacheStrategy, DEFAULT_TTL_SECONDS, InvalidationConfig, InvalidationMode, StrategyRegistry,
    WarmingConfig,
};
