//! Sharded in-memory cache with pluggable eviction.
//!
//! Entries live in `N` independently locked shards. Capacity is enforced
//! with a global atomic count: an insert of a new key first reserves a slot,
//! evicting one victim when the cache is full. Victim search spans every
//! shard so the policy holds cache-wide, not per shard.
//!
//! Custom eviction strategies are called with a shard lock held and must
//! not call back into the cache.

mod config;
mod policy;
mod shard;

pub use config::CacheConfig;
pub use policy::{EntryMeta, EvictionPolicy, EvictionStrategy};

use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::future::Future;
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::telemetry::{self, default_sink, Component, ResourceEvent, SharedSink};
use policy::Policy;
use shard::{Entry, Shard};

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    /// Entries removed to make room.
    pub evictions: u64,
    /// Entries removed because their TTL passed.
    pub expirations: u64,
    pub len: usize,
    pub capacity: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

enum Lookup<V> {
    Hit(V),
    Expired,
    Miss,
}

struct CacheInner<K, V> {
    config: CacheConfig,
    policy: Policy<K, V>,
    shards: Box<[Shard<K, V>]>,
    mask: usize,
    hasher: RandomState,
    /// Stored entries plus reserved slots.
    count: AtomicUsize,
    tick: AtomicU64,
    counters: Counters,
    sink: SharedSink,
    cancel: CancellationToken,
}

impl<K, V> Drop for CacheInner<K, V> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Handle to a cache. Clones share the same entries.
pub struct Cache<K, V> {
    inner: Arc<CacheInner<K, V>>,
}

impl<K, V> Clone for Cache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V> Cache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Build a cache with one of the built-in policies.
    ///
    /// `EvictionPolicy::Custom` needs a strategy; use
    /// [`with_strategy`](Self::with_strategy).
    pub fn new(config: CacheConfig) -> Result<Self> {
        Self::build(config, None, default_sink())
    }

    /// Build a cache evicting by a caller-supplied score.
    pub fn with_strategy(config: CacheConfig, strategy: impl EvictionStrategy<K, V>) -> Result<Self> {
        Self::build(config, Some(Arc::new(strategy)), default_sink())
    }

    /// Build a cache reporting events to `sink`.
    pub fn with_sink(config: CacheConfig, sink: SharedSink) -> Result<Self> {
        Self::build(config, None, sink)
    }

    /// Fully specified constructor. A supplied strategy takes precedence
    /// over `config.policy`.
    pub fn build(
        mut config: CacheConfig,
        strategy: Option<Arc<dyn EvictionStrategy<K, V>>>,
        sink: SharedSink,
    ) -> Result<Self> {
        config.validate()?;
        let policy = match (strategy, config.policy) {
            (Some(strategy), _) => Policy::Custom(strategy),
            (None, EvictionPolicy::Lru) => Policy::Lru,
            (None, EvictionPolicy::Lfu) => Policy::Lfu,
            (None, EvictionPolicy::Ttl) => Policy::Ttl,
            (None, EvictionPolicy::Custom) => {
                return Err(CoreError::InvalidConfig(
                    "custom eviction policy requires a strategy".into(),
                ))
            }
        };
        config.policy = policy.kind();

        let shard_count = config.shard_count();
        let per_shard = config.capacity.div_ceil(shard_count);
        let shards = (0..shard_count)
            .map(|_| Shard::with_capacity(per_shard))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        debug!(
            capacity = config.capacity,
            shards = shard_count,
            policy = ?config.policy,
            "cache created"
        );
        Ok(Self {
            inner: Arc::new(CacheInner {
                config,
                policy,
                shards,
                mask: shard_count - 1,
                hasher: RandomState::new(),
                count: AtomicUsize::new(0),
                tick: AtomicU64::new(0),
                counters: Counters::default(),
                sink,
                cancel: CancellationToken::new(),
            }),
        })
    }

    fn shard_for<Q>(&self, key: &Q) -> &Shard<K, V>
    where
        Q: Hash + ?Sized,
    {
        let index = self.inner.hasher.hash_one(key) as usize & self.inner.mask;
        &self.inner.shards[index]
    }

    fn next_tick(&self) -> u64 {
        self.inner.tick.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Look up a value. Hits refresh recency and frequency; expired entries
    /// are removed and reported as misses.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        let shard = self.shard_for(key);
        let mut map = shard.map.lock();
        let lookup = match map.get_mut(key) {
            Some(entry) if entry.meta.is_expired(now) => Lookup::Expired,
            Some(entry) => {
                entry.meta.touch(self.next_tick());
                Lookup::Hit(entry.value.clone())
            }
            None => Lookup::Miss,
        };

        let counters = &self.inner.counters;
        match lookup {
            Lookup::Hit(value) => {
                drop(map);
                counters.hits.fetch_add(1, Ordering::Relaxed);
                telemetry::record_cache_access(true);
                Some(value)
            }
            Lookup::Expired => {
                let removed = map.remove(key);
                drop(map);
                drop(removed);
                self.inner.count.fetch_sub(1, Ordering::AcqRel);
                self.note_expired(1);
                counters.misses.fetch_add(1, Ordering::Relaxed);
                telemetry::record_cache_access(false);
                None
            }
            Lookup::Miss => {
                drop(map);
                counters.misses.fetch_add(1, Ordering::Relaxed);
                telemetry::record_cache_access(false);
                None
            }
        }
    }

    /// Insert with the configured default TTL.
    pub fn insert(&self, key: K, value: V) {
        self.insert_entry(key, value, self.inner.config.default_ttl);
    }

    /// Insert with an explicit TTL.
    pub fn insert_with_ttl(&self, key: K, value: V, ttl: Duration) {
        self.insert_entry(key, value, Some(ttl));
    }

    fn insert_entry(&self, key: K, value: V, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        let shard = self.shard_for(&key);
        self.inner.counters.inserts.fetch_add(1, Ordering::Relaxed);

        {
            let mut map = shard.map.lock();
            if let Some(entry) = map.get_mut(&key) {
                let previous = std::mem::replace(&mut entry.value, value);
                entry.meta = EntryMeta::new(self.next_tick(), expires_at);
                drop(map);
                drop(previous);
                return;
            }
        }

        self.reserve_slot();
        let entry = Entry {
            value,
            meta: EntryMeta::new(self.next_tick(), expires_at),
        };
        let previous = shard.map.lock().insert(key, entry);
        if previous.is_some() {
            // Another insert of the same key won the race; give back our slot.
            self.inner.count.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Claim room for one new entry, evicting while the cache is full.
    fn reserve_slot(&self) {
        let capacity = self.inner.config.capacity;
        loop {
            let current = self.inner.count.load(Ordering::Acquire);
            if current < capacity {
                if self
                    .inner
                    .count
                    .compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return;
                }
                continue;
            }
            if !self.evict_one() {
                // Every slot is reserved by an in-progress insert.
                std::thread::yield_now();
            }
        }
    }

    /// Remove the single lowest-ranked entry across all shards.
    fn evict_one(&self) -> bool {
        let now = Instant::now();
        let mut best: Option<(usize, K, policy::Rank)> = None;
        for (index, shard) in self.inner.shards.iter().enumerate() {
            let Some((key, rank)) = shard.candidate(&self.inner.policy, now) else {
                continue;
            };
            let expired = rank.0 == 0;
            if best.as_ref().map_or(true, |(_, _, b)| rank < *b) {
                best = Some((index, key, rank));
            }
            if expired {
                break;
            }
        }

        let Some((index, key, rank)) = best else {
            return false;
        };
        let removed = self.inner.shards[index].map.lock().remove(&key);
        if removed.is_none() {
            return false;
        }
        drop(removed);
        self.inner.count.fetch_sub(1, Ordering::AcqRel);

        if rank.0 == 0 {
            self.note_expired(1);
        } else {
            self.inner.counters.evictions.fetch_add(1, Ordering::Relaxed);
            telemetry::record_cache_eviction("capacity", 1);
            self.inner
                .sink
                .record(ResourceEvent::new(Component::Cache, "evict").context("capacity"));
        }
        true
    }

    fn note_expired(&self, removed: usize) {
        self.inner
            .counters
            .expirations
            .fetch_add(removed as u64, Ordering::Relaxed);
        telemetry::record_cache_eviction("expired", removed as u64);
        self.inner.sink.record(
            ResourceEvent::new(Component::Cache, "expire").context(format!("removed={removed}")),
        );
    }

    /// Remove a key. Returns whether it was present.
    pub fn invalidate<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let removed = self.shard_for(key).map.lock().remove(key);
        if removed.is_none() {
            return false;
        }
        drop(removed);
        self.inner.count.fetch_sub(1, Ordering::AcqRel);
        telemetry::record_cache_eviction("invalidated", 1);
        true
    }

    /// Remove every entry.
    pub fn clear(&self) {
        let mut removed = 0;
        for shard in self.inner.shards.iter() {
            let entries = std::mem::take(&mut *shard.map.lock());
            removed += entries.len();
        }
        self.inner.count.fetch_sub(removed, Ordering::AcqRel);
        self.inner
            .sink
            .record(ResourceEvent::new(Component::Cache, "clear").context(format!("removed={removed}")));
    }

    /// True if `key` is present and not expired. Does not count as access.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        self.shard_for(key)
            .map
            .lock()
            .get(key)
            .is_some_and(|entry| !entry.meta.is_expired(now))
    }

    pub fn len(&self) -> usize {
        self.inner.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.config.capacity
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.inner.config.policy
    }

    pub fn shard_count(&self) -> usize {
        self.inner.shards.len()
    }

    /// Return the cached value, or compute, insert and return it.
    ///
    /// Concurrent misses on the same key may each run `init`; the last
    /// insert wins.
    pub async fn get_or_try_insert_with<F, Fut, E>(&self, key: K, init: F) -> std::result::Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<V, E>>,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }
        let value = init().await?;
        self.insert(key, value.clone());
        Ok(value)
    }

    /// Remove every expired entry now.
    pub fn purge_expired(&self) -> usize {
        (0..self.inner.shards.len())
            .map(|index| self.purge_shard(index, usize::MAX))
            .sum()
    }

    fn purge_shard(&self, index: usize, limit: usize) -> usize {
        let removed = self.inner.shards[index].purge(Instant::now(), limit);
        if removed > 0 {
            self.inner.count.fetch_sub(removed, Ordering::AcqRel);
            self.note_expired(removed);
        }
        removed
    }

    /// Start the background expiry sweep on the current runtime.
    ///
    /// The task holds the cache weakly and exits once every handle is gone.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let cache = Arc::downgrade(&self.inner);
        let cancel = self.inner.cancel.clone();
        let every = self.inner.config.sweep_interval;
        let batch = self.inner.config.sweep_batch;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let Some(inner) = cache.upgrade() else {
                    break;
                };
                let cache = Cache { inner };
                let mut removed = 0;
                for index in 0..cache.inner.shards.len() {
                    removed += cache.purge_shard(index, batch);
                    tokio::task::yield_now().await;
                }
                if removed > 0 {
                    debug!(removed, "cache sweep");
                }
            }
            debug!("cache sweeper exited");
        })
    }

    pub fn stats(&self) -> CacheStats {
        let counters = &self.inner.counters;
        CacheStats {
            hits: counters.hits.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
            inserts: counters.inserts.load(Ordering::Relaxed),
            evictions: counters.evictions.load(Ordering::Relaxed),
            expirations: counters.expirations.load(Ordering::Relaxed),
            len: self.len(),
            capacity: self.capacity(),
        }
    }

    /// Entries actually stored, summed over shards.
    pub fn stored(&self) -> usize {
        self.inner.shards.iter().map(Shard::len).sum()
    }
}

impl<K, V> std::fmt::Debug for Cache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("capacity", &self.inner.config.capacity)
            .field("policy", &self.inner.config.policy)
            .field("len", &self.inner.count.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::CollectingSink;

    fn config(capacity: usize, policy: EvictionPolicy) -> CacheConfig {
        CacheConfig {
            capacity,
            policy,
            shards: Some(4),
            ..CacheConfig::default()
        }
    }

    #[test]
    fn test_lru_evicts_least_recently_used() {
        let cache = Cache::new(config(2, EvictionPolicy::Lru)).unwrap();
        cache.insert("a", 1);
        cache.insert("b", 2);
        assert_eq!(cache.get("a"), Some(1));
        cache.insert("c", 3);

        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("c"), Some(3));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_lfu_evicts_least_frequently_used() {
        let cache = Cache::new(config(2, EvictionPolicy::Lfu)).unwrap();
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.get("b");
        cache.get("b");
        cache.get("a");
        cache.insert("c", 3);
        assert!(!cache.contains_key("a"));
        assert!(cache.contains_key("b"));
    }

    #[test]
    fn test_ttl_entry_expires() {
        let cache = Cache::new(config(8, EvictionPolicy::Ttl)).unwrap();
        cache.insert_with_ttl("k", 1, Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn test_replace_does_not_evict() {
        let cache = Cache::new(config(1, EvictionPolicy::Lru)).unwrap();
        cache.insert("a", 1);
        cache.insert("a", 2);
        assert_eq!(cache.get("a"), Some(2));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_expired_entry_is_preferred_victim() {
        let cache = Cache::new(config(2, EvictionPolicy::Lru)).unwrap();
        cache.insert("old", 1);
        cache.insert_with_ttl("short", 2, Duration::from_millis(5));
        cache.get("short");
        std::thread::sleep(Duration::from_millis(10));
        cache.insert("new", 3);
        assert!(cache.contains_key("old"));
        assert!(!cache.contains_key("short"));
        let stats = cache.stats();
        assert_eq!(stats.evictions, 0);
        assert_eq!(stats.expirations, 1);
    }

    #[test]
    fn test_custom_strategy() {
        let cache: Cache<&str, u32> = Cache::with_strategy(
            config(2, EvictionPolicy::Custom),
            |_: &&str, value: &u32, _: &EntryMeta| u64::from(*value),
        )
        .unwrap();
        cache.insert("cheap", 1);
        cache.insert("dear", 100);
        cache.get("cheap");
        cache.insert("mid", 50);
        assert!(!cache.contains_key("cheap"));
        assert_eq!(cache.policy(), EvictionPolicy::Custom);
    }

    #[test]
    fn test_custom_policy_without_strategy_is_rejected() {
        let result = Cache::<String, u32>::new(config(2, EvictionPolicy::Custom));
        assert!(matches!(result, Err(CoreError::InvalidConfig(_))));
    }

    #[test]
    fn test_invalidate_is_idempotent() {
        let sink = CollectingSink::new();
        let cache = Cache::with_sink(config(4, EvictionPolicy::Lru), sink.clone()).unwrap();
        cache.insert(String::from("k"), 1);
        assert!(cache.invalidate("k"));
        assert!(!cache.invalidate("k"));
        assert!(cache.is_empty());

        cache.insert(String::from("x"), 2);
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(sink.matching(Component::Cache, "clear").len(), 1);
    }

    #[test]
    fn test_capacity_never_exceeded_under_contention() {
        let cache = Cache::new(config(16, EvictionPolicy::Lru)).unwrap();
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..500u32 {
                        cache.insert(t * 1000 + i, i);
                        assert!(cache.len() <= 16);
                    }
                })
            })
            .collect();
        for handle in threads {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 16);
        assert_eq!(cache.stored(), 16);
    }

    #[tokio::test]
    async fn test_get_or_try_insert_with() {
        let cache = Cache::new(config(4, EvictionPolicy::Lru)).unwrap();
        let value: std::result::Result<u32, String> =
            cache.get_or_try_insert_with("k", || async { Ok(7) }).await;
        assert_eq!(value, Ok(7));
        let cached: std::result::Result<u32, String> = cache
            .get_or_try_insert_with("k", || async { Err("not called".to_string()) })
            .await;
        assert_eq!(cached, Ok(7));

        let failed: std::result::Result<u32, String> = cache
            .get_or_try_insert_with("other", || async { Err("boom".to_string()) })
            .await;
        assert!(failed.is_err());
        assert!(!cache.contains_key("other"));
    }

    #[tokio::test]
    async fn test_sweeper_removes_expired_entries() {
        let cache = Cache::new(CacheConfig {
            sweep_interval: Duration::from_millis(10),
            ..config(8, EvictionPolicy::Lru)
        })
        .unwrap();
        let sweeper = cache.spawn_sweeper();
        cache.insert_with_ttl(1u32, 1u32, Duration::from_millis(5));
        cache.insert(2, 2);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.stored(), 1);
        assert_eq!(cache.len(), 1);

        drop(cache);
        tokio::time::timeout(Duration::from_secs(1), sweeper)
            .await
            .unwrap()
            .unwrap();
    }
}
