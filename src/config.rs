//! Aggregate configuration for the resource core.
//!
//! Every component takes a plain configuration value at construction time.
//! `CoreConfig` bundles them for applications that build all components
//! together. Nothing here reads files or environment variables; callers
//! construct these values or hand a loaded JSON document to
//! [`CoreConfig::from_json`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::error::{CoreError, Result};
use crate::mapping::MappingRules;
use crate::pool::PoolConfig;
use crate::resource::RegistryConfig;

/// Serde helpers storing `Duration` as integer milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }

    /// Same encoding for optional durations.
    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
        }
    }
}

/// Configuration for every component, as one serializable value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub registry: RegistryConfig,
    pub pool: PoolConfig,
    pub cache: CacheConfig,
    pub mapping: MappingRules,
}

impl CoreConfig {
    /// Parse and validate a JSON document. Missing sections and fields
    /// take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| CoreError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values no component can work with.
    pub fn validate(&self) -> Result<()> {
        if self.registry.batch_size == 0 {
            return Err(CoreError::InvalidConfig("registry.batch_size must be at least 1".into()));
        }
        if self.registry.cleanup_timeout.is_zero() {
            return Err(CoreError::InvalidConfig(
                "registry.cleanup_timeout must be non-zero".into(),
            ));
        }
        self.pool.validate()?;
        self.cache.validate()?;
        Ok(())
    }

    /// Clamp out-of-range values to the nearest usable setting.
    pub fn normalized(mut self) -> Self {
        let registry = &mut self.registry;
        registry.batch_size = registry.batch_size.max(1);
        registry.tick_interval = registry.tick_interval.max(Duration::from_millis(1));
        registry.cleanup_timeout = registry.cleanup_timeout.max(Duration::from_millis(1));

        let pool = &mut self.pool;
        pool.max_size = pool.max_size.max(1);
        pool.min_size = pool.min_size.min(pool.max_size);
        pool.health_check_interval = pool.health_check_interval.max(Duration::from_millis(10));

        let cache = &mut self.cache;
        cache.capacity = cache.capacity.max(1);
        cache.sweep_batch = cache.sweep_batch.max(1);
        if let Some(shards) = cache.shards {
            cache.shards = Some(shards.clamp(1, 1024).next_power_of_two());
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_validates() {
        assert!(CoreConfig::default().validate().is_ok());
    }

    #[test]
    fn test_normalized_clamps() {
        let mut config = CoreConfig::default();
        config.registry.batch_size = 0;
        config.pool.max_size = 0;
        config.pool.min_size = 5;
        config.cache.capacity = 0;
        config.cache.shards = Some(3);

        assert!(config.validate().is_err());
        let config = config.normalized();
        assert!(config.validate().is_ok());
        assert_eq!(config.registry.batch_size, 1);
        assert_eq!(config.pool.max_size, 1);
        assert_eq!(config.pool.min_size, 1);
        assert_eq!(config.cache.capacity, 1);
        assert_eq!(config.cache.shards, Some(4));
    }

    #[test]
    fn test_roundtrip_through_json() {
        let json = r#"{
            "registry": { "tick_interval": 20, "cleanup_timeout": 1000, "shutdown_grace": 3000, "batch_size": 8 },
            "pool": { "min_size": 1, "max_size": 4, "acquire_timeout": 500, "idle_timeout": 60000,
                      "max_lifetime": null, "health_check_interval": 1000 }
        }"#;
        let config: CoreConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.registry.tick_interval, Duration::from_millis(20));
        assert_eq!(config.pool.max_size, 4);
        assert_eq!(config.pool.idle_timeout, Some(Duration::from_secs(60)));
        assert_eq!(config.pool.max_lifetime, None);
        // Sections left out fall back to defaults.
        assert_eq!(config.cache.capacity, CacheConfig::default().capacity);
    }
}
