//! Tiered access coordinator.
//!
//! Reads go primary store, then peers, then the caller's loader. Writes go to
//! the primary store and, for dependency-invalidated strategies, are pushed
//! to peers in the background. Only primary-tier failures surface to the
//! caller; peer failures are logged, counted and absorbed.

use std::collections::{BTreeSet, HashMap};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde::{Serialize, de::DeserializeOwned};
use tiercache_core::{
    CacheEntry, CacheError, CacheNode, CacheStrategy, DependencyGraph, InvalidationMode, Result,
    StrategyRegistry, now_millis,
};
use tracing::{debug, info, warn};

use crate::codec::EnvelopeCodec;
use crate::config::EngineConfig;
use crate::health::{HealthReport, NodeHealthMonitor, NodeRegistry};
use crate::metrics::{CacheMetrics, DEFAULT_BUCKET, MetricsCollector};
use crate::peer::PeerClient;
use crate::store::{BackingStore, create_backing_store};
use crate::task::{BackgroundTask, BackgroundTasks};
use crate::warmer::{CacheWarmer, PatternResolver, WarmLoader, WarmReport};

/// Dependency token under which event-invalidated keys are registered.
pub fn event_token(event: &str) -> String {
    format!("event:{event}")
}

/// Extra inputs to [`CacheEngine::set_with`].
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    pub metadata: HashMap<String, serde_json::Value>,
    /// Tokens this key is invalidated by, in addition to the strategy's own.
    pub dependencies: Vec<String>,
}

impl SetOptions {
    pub fn depends_on(mut self, token: impl Into<String>) -> Self {
        self.dependencies.push(token.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Outcome of [`CacheEngine::sweep_expired`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Expired entries dropped from the backing store.
    pub purged_entries: usize,
    /// Keys whose dependency edges were dropped because the key is gone.
    pub pruned_keys: usize,
}

/// Tracks deletes so a peer read that overlaps one does not write the old
/// value back into the primary tier.
#[derive(Debug, Default)]
struct DeletionTracker {
    generation: AtomicU64,
    in_flight: AtomicUsize,
}

impl DeletionTracker {
    fn begin(&self) -> DeletionGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
        DeletionGuard(self)
    }

    fn snapshot(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// No delete started since `snapshot` and none is running.
    fn quiet_since(&self, snapshot: u64) -> bool {
        self.in_flight.load(Ordering::SeqCst) == 0
            && self.generation.load(Ordering::SeqCst) == snapshot
    }
}

struct DeletionGuard<'a>(&'a DeletionTracker);

impl Drop for DeletionGuard<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

struct EngineInner {
    config: EngineConfig,
    store: Arc<dyn BackingStore>,
    strategies: StrategyRegistry,
    dependencies: DependencyGraph,
    nodes: Arc<NodeRegistry>,
    peers: PeerClient,
    monitor: Arc<NodeHealthMonitor>,
    codec: EnvelopeCodec,
    metrics: MetricsCollector,
    warmer: CacheWarmer,
    deletions: DeletionTracker,
}

/// Handle to the cache engine. Cloning is cheap and shares all state.
#[derive(Clone)]
pub struct CacheEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for CacheEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEngine")
            .field("store", &self.inner.store.kind())
            .field("strategies", &self.inner.strategies.len())
            .field("nodes", &self.inner.nodes.len())
            .finish()
    }
}

impl CacheEngine {
    /// Build an engine over an existing backing store.
    pub fn new(config: EngineConfig, store: Arc<dyn BackingStore>) -> Result<Self> {
        config.validate().map_err(CacheError::configuration)?;

        let codec = EnvelopeCodec::from_key_str(config.encryption_key.as_deref())?;
        let peers = PeerClient::new(
            config.peer_read_timeout(),
            config.peer_write_timeout(),
            config.health_probe_timeout(),
        )?;
        let nodes = Arc::new(NodeRegistry::new(config.peer_failure_threshold));
        let monitor = Arc::new(NodeHealthMonitor::new(
            Arc::clone(&nodes),
            peers.clone(),
            config.health_check_interval(),
        ));

        let strategies = StrategyRegistry::new();
        for (name, strategy) in &config.strategies {
            strategies.register(name.clone(), strategy.clone())?;
        }
        for node in &config.nodes {
            nodes.add(CacheNode::from(node));
        }

        info!(
            store = store.kind(),
            strategies = strategies.len(),
            nodes = nodes.len(),
            "Cache engine initialized"
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                warmer: CacheWarmer::new(config.loader_timeout()),
                config,
                store,
                strategies,
                dependencies: DependencyGraph::new(),
                nodes,
                peers,
                monitor,
                codec,
                metrics: MetricsCollector::new(),
                deletions: DeletionTracker::default(),
            }),
        })
    }

    /// Build an engine and the backing store its configuration names.
    pub async fn from_config(config: EngineConfig) -> Result<Self> {
        let store = create_backing_store(&config.store).await;
        Self::new(config, store)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn BackingStore> {
        &self.inner.store
    }

    pub fn strategies(&self) -> &StrategyRegistry {
        &self.inner.strategies
    }

    pub fn dependencies(&self) -> &DependencyGraph {
        &self.inner.dependencies
    }

    // ---------------------------------------------------------------------
    // Administration
    // ---------------------------------------------------------------------

    pub fn register_strategy(&self, name: impl Into<String>, strategy: CacheStrategy) -> Result<()> {
        let name = name.into();
        if strategy.encryption && !self.inner.codec.can_encrypt() {
            return Err(CacheError::invalid_strategy(
                name,
                "encryption requires an engine encryption key",
            ));
        }
        self.inner.strategies.register(name, strategy)
    }

    pub fn strategy(&self, name: &str) -> Result<Arc<CacheStrategy>> {
        self.inner.strategies.resolve(name)
    }

    pub fn add_node(&self, node: CacheNode) {
        self.inner.nodes.add(node);
    }

    pub fn remove_node(&self, id: &str) -> Option<CacheNode> {
        self.inner.nodes.remove(id)
    }

    pub fn nodes(&self) -> Vec<CacheNode> {
        self.inner.nodes.list()
    }

    pub fn metrics(&self, strategy: &str) -> CacheMetrics {
        self.inner.metrics.snapshot(strategy)
    }

    pub fn all_metrics(&self) -> HashMap<String, CacheMetrics> {
        self.inner.metrics.snapshot_all()
    }

    pub fn reset_metrics(&self, strategy: Option<&str>) {
        self.inner.metrics.reset(strategy);
    }

    pub fn register_warming(
        &self,
        strategy: impl Into<String>,
        resolver: Arc<dyn PatternResolver>,
        loader: Arc<dyn WarmLoader>,
    ) {
        self.inner.warmer.register(strategy, resolver, loader);
    }

    /// Stop warming a strategy. Returns false if it had no warming source.
    pub fn unregister_warming(&self, strategy: &str) -> bool {
        self.inner.warmer.unregister(strategy)
    }

    pub async fn warm_strategy(&self, strategy: &str) -> Result<WarmReport> {
        self.inner.warmer.warm(self, strategy).await
    }

    pub async fn warm_all(&self) -> Vec<WarmReport> {
        self.inner.warmer.warm_all(self).await
    }

    pub async fn probe_nodes(&self) -> HealthReport {
        self.inner.monitor.probe_all().await
    }

    /// Start health probing, scheduled warming and the expiry sweep.
    pub fn start_background_tasks(&self) -> BackgroundTasks {
        let health = Arc::clone(&self.inner.monitor).start();

        let engine = self.clone();
        let warmer = BackgroundTask::spawn(
            "cache-warmer",
            self.inner.config.warming_interval(),
            move || {
                let engine = engine.clone();
                async move {
                    engine.inner.warmer.warm_due(&engine).await;
                }
            },
        );

        let engine = self.clone();
        let sweeper = BackgroundTask::spawn(
            "cache-sweeper",
            self.inner.config.sweep_interval(),
            move || {
                let engine = engine.clone();
                async move {
                    engine.sweep_expired().await;
                }
            },
        );

        BackgroundTasks {
            health,
            warmer,
            sweeper,
        }
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    /// Read a value through the primary and peer tiers.
    ///
    /// Returns `Ok(None)` on a full miss. Errors only when the primary store
    /// failed and no peer had the key.
    pub async fn get<T>(&self, key: &str, strategy: &str) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        let started = Instant::now();
        let found = self.lookup(key, strategy, started).await?;
        if found.is_none() {
            self.inner.metrics.record_miss(strategy, Some(started.elapsed()));
            debug!(key = %key, strategy = %strategy, "cache miss");
        }
        Ok(found)
    }

    /// Read a value, running `loader` on a miss and caching its result.
    ///
    /// A primary-store failure is treated as a miss.
    pub async fn get_or_load<T, F, Fut, E>(&self, key: &str, strategy: &str, loader: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Display,
    {
        let started = Instant::now();
        match self.lookup::<T>(key, strategy, started).await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(e) => {
                warn!(key = %key, strategy = %strategy, error = %e, "Primary tier failed, using loader");
            }
        }

        let loaded = match tokio::time::timeout(self.inner.config.loader_timeout(), loader()).await {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                self.inner.metrics.record_error(strategy, None);
                return Err(CacheError::loader(e.to_string()));
            }
            Err(_) => {
                self.inner.metrics.record_error(strategy, None);
                return Err(CacheError::loader(format!(
                    "loader for '{key}' timed out after {:?}",
                    self.inner.config.loader_timeout()
                )));
            }
        };

        if let Err(e) = self.set(key, &loaded, strategy).await {
            warn!(key = %key, strategy = %strategy, error = %e, "Failed to cache loaded value");
        }
        self.inner.metrics.record_miss(strategy, Some(started.elapsed()));
        Ok(loaded)
    }

    /// Full envelope from the primary tier, without touching `hit_count`.
    pub async fn get_entry<T>(&self, key: &str) -> Result<Option<CacheEntry<T>>>
    where
        T: DeserializeOwned,
    {
        let Some(bytes) = self.store_get(key).await? else {
            return Ok(None);
        };
        self.inner.codec.decode(&bytes).map(Some)
    }

    /// Primary then peers. Records hits and errors; misses are left to the
    /// caller so `get_or_load` can count a loaded value once.
    async fn lookup<T>(&self, key: &str, strategy: &str, started: Instant) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        let (policy, known) = self.inner.strategies.resolve_or_default(strategy);
        let generation = self.inner.deletions.snapshot();

        let primary = match self.primary_lookup::<T>(key, &policy, known).await {
            Ok(Some(value)) => {
                self.inner.metrics.record_hit(strategy, Some(started.elapsed()));
                debug!(key = %key, strategy = %strategy, tier = "primary", "cache hit");
                return Ok(Some(value));
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.inner.metrics.record_error(strategy, None);
                warn!(key = %key, strategy = %strategy, error = %e, "Primary tier read failed");
                Err(e)
            }
        };

        if let Some(value) = self.peer_lookup::<T>(key, strategy, &policy, generation).await {
            self.inner.metrics.record_hit(strategy, Some(started.elapsed()));
            debug!(key = %key, strategy = %strategy, tier = "peer", "cache hit");
            return Ok(Some(value));
        }

        primary
    }

    async fn primary_lookup<T>(
        &self,
        key: &str,
        policy: &CacheStrategy,
        strategy_known: bool,
    ) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        let Some(bytes) = self.store_get(key).await? else {
            // The store may have expired the key on its own.
            self.forget_dependencies(key).await;
            return Ok(None);
        };

        let mut entry: CacheEntry<T> = match self.inner.codec.decode(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key = %key, error = %e, "Undecodable entry, removing");
                self.discard(key, &bytes).await;
                return Ok(None);
            }
        };

        let ttl = if strategy_known {
            policy.effective_ttl(self.inner.store.default_ttl())
        } else {
            entry.own_ttl()
        };
        let now = now_millis();
        if !entry.is_valid_at(now, ttl) {
            debug!(key = %key, "Expired entry, removing");
            self.discard(key, &bytes).await;
            return Ok(None);
        }

        // The hit count is written back only over the exact bytes read, so a
        // concurrent set or delete always wins.
        entry.record_hit();
        let remaining = entry.remaining_at(now, ttl);
        if !remaining.is_zero() {
            match self.encode(policy, &entry) {
                Ok(updated) => match with_timeout(
                    self.inner.config.store_write_timeout(),
                    "compare_and_set",
                    self.inner.store.compare_and_set(key, &bytes, updated, remaining),
                )
                .await
                {
                    Ok(true) => {}
                    Ok(false) => debug!(key = %key, "Entry changed during read, hit count not written back"),
                    Err(e) => debug!(key = %key, error = %e, "hit count write-back failed"),
                },
                Err(e) => debug!(key = %key, error = %e, "hit count write-back failed"),
            }
        }

        Ok(Some(entry.data))
    }

    async fn peer_lookup<T>(
        &self,
        key: &str,
        strategy: &str,
        policy: &CacheStrategy,
        generation: u64,
    ) -> Option<T>
    where
        T: DeserializeOwned,
    {
        let candidates = self.inner.nodes.list_routable();
        for node in candidates.iter().take(self.inner.config.max_peer_reads) {
            match self.inner.peers.get(node, key).await {
                Ok(Some(raw)) => {
                    self.inner.nodes.record_peer_success(&node.id);
                    let value = match serde_json::from_value::<T>(raw.clone()) {
                        Ok(value) => value,
                        Err(e) => {
                            warn!(key = %key, node_id = %node.id, error = %e, "Peer value has unexpected shape");
                            continue;
                        }
                    };
                    self.write_through(key, &raw, strategy, policy, generation).await;
                    return Some(value);
                }
                Ok(None) => self.inner.nodes.record_peer_success(&node.id),
                Err(e) => {
                    warn!(key = %key, node_id = %node.id, error = %e, "Peer read failed");
                    self.inner.metrics.record_error(strategy, None);
                    self.inner.nodes.record_peer_failure(&node.id);
                }
            }
        }
        None
    }

    /// Read many keys from the primary tier only.
    pub async fn get_many<T>(&self, keys: &[String], strategy: &str) -> Result<HashMap<String, T>>
    where
        T: DeserializeOwned,
    {
        let started = Instant::now();
        let (policy, known) = self.inner.strategies.resolve_or_default(strategy);
        let raw = with_timeout(
            self.inner.config.store_read_timeout(),
            "multi_get",
            self.inner.store.multi_get(keys),
        )
        .await
        .inspect_err(|_| self.inner.metrics.record_error(strategy, None))?;

        let now = now_millis();
        let mut found = HashMap::with_capacity(raw.len());
        for (key, bytes) in raw {
            match self.inner.codec.decode::<T>(&bytes) {
                Ok(entry) => {
                    let ttl = if known {
                        policy.effective_ttl(self.inner.store.default_ttl())
                    } else {
                        entry.own_ttl()
                    };
                    if entry.is_valid_at(now, ttl) {
                        found.insert(key, entry.data);
                    } else {
                        self.discard(&key, &bytes).await;
                    }
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Undecodable entry, removing");
                    self.discard(&key, &bytes).await;
                }
            }
        }

        let elapsed = started.elapsed();
        for key in keys {
            if found.contains_key(key) {
                self.inner.metrics.record_hit(strategy, Some(elapsed));
            } else {
                self.inner.metrics.record_miss(strategy, Some(elapsed));
            }
        }
        Ok(found)
    }

    // ---------------------------------------------------------------------
    // Writes
    // ---------------------------------------------------------------------

    pub async fn set<T: Serialize>(&self, key: &str, value: &T, strategy: &str) -> Result<()> {
        self.set_with(key, value, strategy, SetOptions::default()).await
    }

    pub async fn set_with<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        strategy: &str,
        options: SetOptions,
    ) -> Result<()> {
        let started = Instant::now();
        let (policy, _) = self.inner.strategies.resolve_or_default(strategy);
        let ttl = policy.effective_ttl(self.inner.store.default_ttl());

        let entry = CacheEntry::new(value, ttl)
            .with_strategy(strategy)
            .with_metadata(options.metadata);
        let written = match self.encode(&policy, &entry) {
            Ok(bytes) => self.store_set(key, bytes, ttl).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            self.inner.metrics.record_error(strategy, None);
            return Err(e);
        }
        self.inner.metrics.record_set(strategy, Some(started.elapsed()));
        debug!(key = %key, strategy = %strategy, ttl_secs = ttl.as_secs(), "cache set");

        let tokens = tokens_for(&policy, options.dependencies);
        for token in &tokens {
            self.inner.dependencies.add_edge(key, token);
        }

        if policy.invalidation.mode == InvalidationMode::Dependency && !tokens.is_empty() {
            match serde_json::to_value(value) {
                Ok(json) => self.spawn_replication(key.to_string(), json, ttl, strategy.to_string()),
                Err(e) => warn!(key = %key, error = %e, "Value not representable as JSON, skipping peer push"),
            }
        }

        Ok(())
    }

    /// Write many values under one strategy to the primary tier.
    pub async fn set_many<T: Serialize>(&self, entries: &HashMap<String, T>, strategy: &str) -> Result<()> {
        let started = Instant::now();
        let (policy, _) = self.inner.strategies.resolve_or_default(strategy);
        let ttl = policy.effective_ttl(self.inner.store.default_ttl());

        let mut encoded = HashMap::with_capacity(entries.len());
        for (key, value) in entries {
            let entry = CacheEntry::new(value, ttl).with_strategy(strategy);
            let bytes = self
                .encode(&policy, &entry)
                .inspect_err(|_| self.inner.metrics.record_error(strategy, None))?;
            encoded.insert(key.clone(), bytes);
        }

        with_timeout(
            self.inner.config.store_write_timeout(),
            "multi_set",
            self.inner.store.multi_set(encoded, Some(ttl)),
        )
        .await
        .inspect_err(|_| self.inner.metrics.record_error(strategy, None))?;

        let tokens = tokens_for(&policy, Vec::new());
        let elapsed = started.elapsed();
        for key in entries.keys() {
            self.inner.metrics.record_set(strategy, Some(elapsed));
            for token in &tokens {
                self.inner.dependencies.add_edge(key, token);
            }
        }
        Ok(())
    }

    fn spawn_replication(&self, key: String, value: serde_json::Value, ttl: Duration, strategy: String) {
        let engine = self.clone();
        tokio::spawn(async move {
            let nodes = engine.inner.nodes.list_routable();
            if nodes.is_empty() {
                return;
            }
            let results = join_all(
                nodes
                    .iter()
                    .map(|node| engine.inner.peers.put(node, &key, &value, ttl)),
            )
            .await;
            for (node, result) in nodes.iter().zip(results) {
                match result {
                    Ok(()) => engine.inner.nodes.record_peer_success(&node.id),
                    Err(e) => {
                        warn!(key = %key, node_id = %node.id, error = %e, "Peer write failed");
                        engine.inner.metrics.record_error(&strategy, None);
                        engine.inner.nodes.record_peer_failure(&node.id);
                    }
                }
            }
        });
    }

    // ---------------------------------------------------------------------
    // Deletes and invalidation
    // ---------------------------------------------------------------------

    /// Remove a key from every tier and cascade to its dependents.
    ///
    /// Peer pushes from an earlier `set` run in the background and are not
    /// ordered against this delete: a push that lands after it leaves the
    /// old value on that peer until its TTL runs out.
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.remove_and_cascade(key).await.map(|_| ())
    }

    /// Invalidate everything registered against `token`. Returns the number
    /// of dependent keys removed.
    pub async fn invalidate(&self, token: &str) -> Result<usize> {
        self.remove_and_cascade(token).await
    }

    /// Invalidate every key written under a strategy listing `event`.
    pub async fn invalidate_event(&self, event: &str) -> Result<usize> {
        self.remove_and_cascade(&event_token(event)).await
    }

    async fn remove_and_cascade(&self, key: &str) -> Result<usize> {
        let _deleting = self.inner.deletions.begin();
        let started = Instant::now();
        self.store_delete(key)
            .await
            .inspect_err(|_| self.inner.metrics.record_error(DEFAULT_BUCKET, None))?;
        self.delete_from_peers(key).await;
        self.inner
            .metrics
            .record_delete(DEFAULT_BUCKET, Some(started.elapsed()));

        let outcome = self
            .inner
            .dependencies
            .cascade_delete(key, |dependent| async move {
                self.store_delete(&dependent).await?;
                self.delete_from_peers(&dependent).await;
                self.inner.metrics.record_delete(DEFAULT_BUCKET, None);
                Ok::<(), CacheError>(())
            })
            .await;

        for (dependent, e) in &outcome.failed {
            warn!(key = %dependent, root = %key, error = %e, "Cascading delete failed");
            self.inner.metrics.record_error(DEFAULT_BUCKET, None);
        }
        if !outcome.deleted.is_empty() {
            info!(root = %key, cascaded = outcome.deleted.len(), "Invalidated dependent keys");
        }
        Ok(outcome.deleted.len())
    }

    async fn delete_from_peers(&self, key: &str) {
        let nodes = self.inner.nodes.list_routable();
        if nodes.is_empty() {
            return;
        }
        let results = join_all(nodes.iter().map(|node| self.inner.peers.delete(node, key))).await;
        for (node, result) in nodes.iter().zip(results) {
            match result {
                Ok(()) => self.inner.nodes.record_peer_success(&node.id),
                Err(e) => {
                    warn!(key = %key, node_id = %node.id, error = %e, "Peer delete failed");
                    self.inner.metrics.record_error(DEFAULT_BUCKET, None);
                    self.inner.nodes.record_peer_failure(&node.id);
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // Peer-serving operations (local tier only, never fan out)
    // ---------------------------------------------------------------------

    /// Serve `GET /cache/{key}` for another node.
    pub async fn peer_read(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let Some(bytes) = self.store_get(key).await? else {
            return Ok(None);
        };
        let entry: CacheEntry<serde_json::Value> = match self.inner.codec.decode(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key = %key, error = %e, "Undecodable entry, removing");
                self.discard(key, &bytes).await;
                return Ok(None);
            }
        };

        let ttl = entry
            .strategy
            .as_deref()
            .and_then(|name| self.inner.strategies.resolve(name).ok())
            .map(|policy| policy.effective_ttl(self.inner.store.default_ttl()))
            .unwrap_or_else(|| entry.own_ttl());
        if !entry.is_valid(ttl) {
            self.discard(key, &bytes).await;
            return Ok(None);
        }
        Ok(Some(entry.data))
    }

    /// Serve `PUT /cache/{key}`. A zero TTL applies the store default.
    pub async fn peer_write(&self, key: &str, value: serde_json::Value, ttl_seconds: u64) -> Result<()> {
        let ttl = if ttl_seconds == 0 {
            self.inner.store.default_ttl()
        } else {
            Duration::from_secs(ttl_seconds)
        };
        let bytes = self.inner.codec.encode(&CacheEntry::new(value, ttl), false, false)?;
        self.store_set(key, bytes, ttl).await
    }

    /// Serve `DELETE /cache/{key}`.
    pub async fn peer_delete(&self, key: &str) -> Result<()> {
        let _deleting = self.inner.deletions.begin();
        self.store_delete(key).await
    }

    // ---------------------------------------------------------------------
    // Expiry sweep
    // ---------------------------------------------------------------------

    /// Purge expired entries the store keeps around and drop the dependency
    /// edges of keys that no longer exist.
    pub async fn sweep_expired(&self) -> SweepReport {
        let purged_entries = self.inner.store.purge_expired();
        let mut pruned_keys = 0;
        for key in self.inner.dependencies.keys() {
            match self.store_exists(&key).await {
                Ok(true) => {}
                Ok(false) => {
                    if self.forget_dependencies(&key).await {
                        pruned_keys += 1;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Dependency sweep stopped, store unavailable");
                    break;
                }
            }
        }
        if purged_entries > 0 || pruned_keys > 0 {
            debug!(purged_entries, pruned_keys, "Expiry sweep finished");
        }
        SweepReport {
            purged_entries,
            pruned_keys,
        }
    }

    /// Drop the dependency edges of a key that left the store. Edges are put
    /// back if a concurrent set re-created the key meanwhile.
    async fn forget_dependencies(&self, key: &str) -> bool {
        let tokens = self.inner.dependencies.remove_dependencies(key);
        if tokens.is_empty() {
            return false;
        }
        if !matches!(self.store_exists(key).await, Ok(false)) {
            for token in &tokens {
                self.inner.dependencies.add_edge(key, token);
            }
            return false;
        }
        true
    }

    // ---------------------------------------------------------------------
    // Primary store plumbing
    // ---------------------------------------------------------------------

    /// Copy a peer hit into the primary tier. Never overwrites a value
    /// written meanwhile, and backs out if a delete overlapped the read.
    async fn write_through(
        &self,
        key: &str,
        value: &serde_json::Value,
        strategy: &str,
        policy: &CacheStrategy,
        generation: u64,
    ) {
        if !self.inner.deletions.quiet_since(generation) {
            debug!(key = %key, "Delete overlapped peer read, skipping write-through");
            return;
        }
        let ttl = policy.effective_ttl(self.inner.store.default_ttl());
        let entry = CacheEntry::new(value, ttl).with_strategy(strategy);
        let bytes = match self.encode(policy, &entry) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to encode peer value");
                return;
            }
        };

        let written = with_timeout(
            self.inner.config.store_write_timeout(),
            "set_if_absent",
            self.inner.store.set_if_absent(key, bytes.clone(), ttl),
        )
        .await;
        match written {
            Ok(true) => {}
            Ok(false) => {
                debug!(key = %key, "Key written meanwhile, keeping it over the peer value");
                return;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to write peer value through to primary");
                return;
            }
        }

        if !self.inner.deletions.quiet_since(generation) {
            let undone = with_timeout(
                self.inner.config.store_write_timeout(),
                "compare_and_delete",
                self.inner.store.compare_and_delete(key, &bytes),
            )
            .await;
            if let Err(e) = undone {
                warn!(key = %key, error = %e, "Failed to back out write-through after delete");
            }
        }
    }

    fn encode<T: Serialize>(&self, policy: &CacheStrategy, entry: &CacheEntry<T>) -> Result<Vec<u8>> {
        self.inner
            .codec
            .encode(entry, policy.compression, policy.encryption)
    }

    async fn store_get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        with_timeout(
            self.inner.config.store_read_timeout(),
            "get",
            self.inner.store.get(key),
        )
        .await
    }

    async fn store_set(&self, key: &str, bytes: Vec<u8>, ttl: Duration) -> Result<()> {
        with_timeout(
            self.inner.config.store_write_timeout(),
            "set",
            self.inner.store.set_with_ttl(key, bytes, ttl),
        )
        .await
    }

    async fn store_exists(&self, key: &str) -> Result<bool> {
        with_timeout(
            self.inner.config.store_read_timeout(),
            "exists",
            self.inner.store.exists(key),
        )
        .await
    }

    async fn store_delete(&self, key: &str) -> Result<()> {
        with_timeout(
            self.inner.config.store_write_timeout(),
            "delete",
            self.inner.store.delete(key),
        )
        .await
    }

    /// Best-effort removal of an invalid entry, only while the key still
    /// holds the bytes that were judged invalid.
    async fn discard(&self, key: &str, seen: &[u8]) {
        let removed = with_timeout(
            self.inner.config.store_write_timeout(),
            "compare_and_delete",
            self.inner.store.compare_and_delete(key, seen),
        )
        .await;
        match removed {
            Ok(true) => {
                self.forget_dependencies(key).await;
            }
            Ok(false) => {}
            Err(e) => debug!(key = %key, error = %e, "Failed to remove invalid entry"),
        }
    }
}

/// Bound a primary-store call; an elapsed timer is a store failure.
async fn with_timeout<T>(
    limit: Duration,
    operation: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| CacheError::backing_store(format!("{operation} timed out after {limit:?}")))?
}

/// Call-site tokens plus the tokens implied by the strategy's mode.
fn tokens_for(policy: &CacheStrategy, call_site: Vec<String>) -> BTreeSet<String> {
    let mut tokens: BTreeSet<String> = call_site.into_iter().collect();
    match policy.invalidation.mode {
        InvalidationMode::Dependency => {
            tokens.extend(policy.invalidation.dependency_tokens.iter().cloned());
        }
        InvalidationMode::Event => {
            tokens.extend(policy.invalidation.event_names.iter().map(|e| event_token(e)));
        }
        InvalidationMode::Time | InvalidationMode::Manual => {}
    }
    tokens
}
