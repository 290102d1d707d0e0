//! Cache configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::policy::EvictionPolicy;
use crate::error::{CoreError, Result};

/// Configuration for a [`Cache`](super::Cache).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries.
    pub capacity: usize,
    pub policy: EvictionPolicy,
    /// TTL applied by `insert`. `None` keeps entries until evicted.
    #[serde(with = "crate::config::duration_ms::option")]
    pub default_ttl: Option<Duration>,
    /// Shard count, a power of two. `None` derives it from the CPU count.
    pub shards: Option<usize>,
    /// Interval of the background expiry sweep.
    #[serde(with = "crate::config::duration_ms")]
    pub sweep_interval: Duration,
    /// Expired entries removed per shard per sweep.
    pub sweep_batch: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            policy: EvictionPolicy::Lru,
            default_ttl: None,
            shards: None,
            sweep_interval: Duration::from_secs(1),
            sweep_batch: 128,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(CoreError::InvalidConfig("cache.capacity must be at least 1".into()));
        }
        if let Some(shards) = self.shards {
            if shards == 0 || !shards.is_power_of_two() {
                return Err(CoreError::InvalidConfig(format!(
                    "cache.shards must be a power of two, got {shards}"
                )));
            }
        }
        if self.default_ttl.is_some_and(|ttl| ttl.is_zero()) {
            return Err(CoreError::InvalidConfig("cache.default_ttl must be non-zero".into()));
        }
        if self.sweep_interval.is_zero() || self.sweep_batch == 0 {
            return Err(CoreError::InvalidConfig(
                "cache sweep interval and batch must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Shard count actually used.
    pub fn shard_count(&self) -> usize {
        self.shards
            .unwrap_or_else(|| (num_cpus::get() * 4).next_power_of_two())
            .clamp(1, 1024)
    }
}
