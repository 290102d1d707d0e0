//! Connection pool configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Configuration for a [`Pool`](super::Pool).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Connections kept open even when idle.
    pub min_size: usize,
    /// Hard limit on idle + checked-out + validating connections.
    pub max_size: usize,
    /// Default time `acquire` waits before failing.
    #[serde(with = "crate::config::duration_ms")]
    pub acquire_timeout: Duration,
    /// Idle connections above `min_size` older than this are closed.
    #[serde(with = "crate::config::duration_ms::option")]
    pub idle_timeout: Option<Duration>,
    /// Connections older than this are closed regardless of use.
    #[serde(with = "crate::config::duration_ms::option")]
    pub max_lifetime: Option<Duration>,
    /// Interval of the maintenance task.
    #[serde(with = "crate::config::duration_ms")]
    pub health_check_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 0,
            max_size: 10,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(600)),
            max_lifetime: None,
            health_check_interval: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(CoreError::InvalidConfig("pool.max_size must be at least 1".into()));
        }
        if self.min_size > self.max_size {
            return Err(CoreError::InvalidConfig(format!(
                "pool.min_size ({}) exceeds pool.max_size ({})",
                self.min_size, self.max_size
            )));
        }
        if self.health_check_interval.is_zero() {
            return Err(CoreError::InvalidConfig(
                "pool.health_check_interval must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
