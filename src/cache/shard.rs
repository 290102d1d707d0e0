//! One lock-protected partition of the cache.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Instant;

use parking_lot::Mutex;

use super::policy::{EntryMeta, Policy, Rank};

pub(crate) struct Entry<V> {
    pub(crate) value: V,
    pub(crate) meta: EntryMeta,
}

pub(crate) struct Shard<K, V> {
    pub(crate) map: Mutex<HashMap<K, Entry<V>>>,
}

impl<K: Hash + Eq + Clone + 'static, V: 'static> Shard<K, V> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            map: Mutex::new(HashMap::with_capacity(capacity)),
        }
    }

    /// Lowest-ranked entry of this shard. An expired entry ends the scan.
    pub(crate) fn candidate(&self, policy: &Policy<K, V>, now: Instant) -> Option<(K, Rank)> {
        let map = self.map.lock();
        let mut best: Option<(&K, Rank)> = None;
        for (key, entry) in map.iter() {
            let rank = policy.rank(key, &entry.value, &entry.meta, now);
            if rank.0 == 0 {
                return Some((key.clone(), rank));
            }
            if best.as_ref().map_or(true, |(_, b)| rank < *b) {
                best = Some((key, rank));
            }
        }
        best.map(|(key, rank)| (key.clone(), rank))
    }

    /// Remove up to `limit` expired entries.
    pub(crate) fn purge(&self, now: Instant, limit: usize) -> usize {
        let mut map = self.map.lock();
        let expired: Vec<K> = map
            .iter()
            .filter(|(_, entry)| entry.meta.is_expired(now))
            .take(limit)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            map.remove(key);
        }
        expired.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.map.lock().len()
    }
}
