//! Eviction policies.
//!
//! Every policy reduces an entry to a rank; the entry with the lowest rank
//! across all shards is the victim. Expired entries always rank first.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Bookkeeping kept next to every cached value.
#[derive(Debug, Clone, Copy)]
pub struct EntryMeta {
    pub inserted: Instant,
    /// Logical access tick; larger is more recent.
    pub last_access: u64,
    /// Successful lookups since insertion.
    pub hits: u64,
    pub expires_at: Option<Instant>,
}

impl EntryMeta {
    pub(crate) fn new(tick: u64, expires_at: Option<Instant>) -> Self {
        Self {
            inserted: Instant::now(),
            last_access: tick,
            hits: 0,
            expires_at,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub(crate) fn touch(&mut self, tick: u64) {
        self.last_access = tick;
        self.hits += 1;
    }
}

/// Caller-supplied eviction rule. The entry with the lowest score is
/// evicted; ties go to the least recently used.
pub trait EvictionStrategy<K, V>: Send + Sync + 'static {
    fn score(&self, key: &K, value: &V, meta: &EntryMeta) -> u64;
}

impl<K, V, F> EvictionStrategy<K, V> for F
where
    F: Fn(&K, &V, &EntryMeta) -> u64 + Send + Sync + 'static,
{
    fn score(&self, key: &K, value: &V, meta: &EntryMeta) -> u64 {
        self(key, value, meta)
    }
}

/// Policy selector stored in configuration.
///
/// `Custom` only marks intent; the strategy itself is passed to
/// [`Cache::with_strategy`](super::Cache::with_strategy).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    #[default]
    Lru,
    Lfu,
    Ttl,
    Custom,
}

/// Resolved policy used at runtime.
pub(crate) enum Policy<K, V> {
    Lru,
    Lfu,
    Ttl,
    Custom(Arc<dyn EvictionStrategy<K, V>>),
}

/// Lower ranks are evicted first.
pub(crate) type Rank = (u8, u64, u64);

impl<K: 'static, V: 'static> Policy<K, V> {
    pub(crate) fn kind(&self) -> EvictionPolicy {
        match self {
            Self::Lru => EvictionPolicy::Lru,
            Self::Lfu => EvictionPolicy::Lfu,
            Self::Ttl => EvictionPolicy::Ttl,
            Self::Custom(_) => EvictionPolicy::Custom,
        }
    }

    pub(crate) fn rank(&self, key: &K, value: &V, meta: &EntryMeta, now: Instant) -> Rank {
        if meta.is_expired(now) {
            return (0, 0, meta.last_access);
        }
        match self {
            Self::Lru => (1, meta.last_access, 0),
            Self::Lfu => (1, meta.hits, meta.last_access),
            Self::Ttl => {
                let remaining = meta
                    .expires_at
                    .map(|at| at.saturating_duration_since(now).as_nanos() as u64)
                    .unwrap_or(u64::MAX);
                (1, remaining, meta.last_access)
            }
            Self::Custom(strategy) => (1, strategy.score(key, value, meta), meta.last_access),
        }
    }
}
