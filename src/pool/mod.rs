//! Generic async connection pool.
//!
//! The pool never knows what a connection is; a [`ConnectionManager`]
//! creates, validates and recycles them. Checked-out connections come back
//! on drop, are validated off the caller's path, and go to the oldest
//! waiter before anyone else.

mod config;
mod connection;
mod inner;
mod manager;

pub use config::PoolConfig;
pub use connection::PooledConnection;
pub use inner::PoolStatus;
pub use manager::ConnectionManager;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::error::Result;
use crate::shutdown::{DrainResult, ShutdownState};
use crate::telemetry::{default_sink, SharedSink};
use inner::{run_maintenance, PoolInner};

/// Handle to a connection pool. Clones share the same pool.
pub struct Pool<M: ConnectionManager> {
    inner: Arc<PoolInner<M>>,
}

impl<M: ConnectionManager> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M: ConnectionManager> Pool<M> {
    /// Build a pool, open `min_size` connections and start maintenance.
    pub async fn new(manager: M, config: PoolConfig) -> Result<Self> {
        Self::with_sink(manager, config, default_sink()).await
    }

    /// [`new`](Self::new) reporting events to `sink`.
    pub async fn with_sink(manager: M, config: PoolConfig, sink: SharedSink) -> Result<Self> {
        config.validate()?;
        let every = config.health_check_interval;
        let inner = Arc::new_cyclic(|weak| PoolInner::new(weak.clone(), manager, config, sink));

        let opened = inner.fill_to_min().await?;
        tokio::spawn(run_maintenance(
            Arc::downgrade(&inner),
            inner.cancel.clone(),
            every,
        ));
        info!(
            min_size = inner.config().min_size,
            max_size = inner.config().max_size,
            opened,
            "connection pool started"
        );
        Ok(Self { inner })
    }

    /// Check out a connection, waiting up to the configured `acquire_timeout`.
    pub async fn acquire(&self) -> Result<PooledConnection<M>> {
        self.inner.acquire(self.inner.config().acquire_timeout).await
    }

    /// Check out a connection, waiting up to `timeout`.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<PooledConnection<M>> {
        self.inner.acquire(timeout).await
    }

    /// Check out a connection only if one is available now; returns
    /// `CoreError::Exhausted` instead of waiting.
    pub async fn try_acquire(&self) -> Result<PooledConnection<M>> {
        self.inner.try_acquire().await
    }

    pub fn status(&self) -> PoolStatus {
        self.inner.status()
    }

    pub fn state(&self) -> ShutdownState {
        self.inner.lifecycle_state()
    }

    pub fn config(&self) -> &PoolConfig {
        self.inner.config()
    }

    pub fn manager(&self) -> &M {
        self.inner.manager()
    }

    /// Run one maintenance pass now instead of waiting for the next tick.
    pub async fn run_maintenance(&self) {
        self.inner.maintain().await;
    }

    /// Close the pool. Pending and later acquires fail with `ShuttingDown`;
    /// connections still checked out are closed when they come back.
    pub async fn close(&self, grace: Duration) -> DrainResult {
        self.inner.close(grace).await
    }
}

impl<M: ConnectionManager> std::fmt::Debug for Pool<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool").field("status", &self.status()).finish()
    }
}
