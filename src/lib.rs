//! Core resource management
//!
//! Building blocks for services that hold scarce or expensive resources:
//!
//! - [`resource`]: guards whose cleanup is tracked and scheduled by a
//!   [`ResourceRegistry`] instead of running inline on drop.
//! - [`pool`]: a generic async connection pool over a [`ConnectionManager`].
//! - [`cache`]: a sharded cache with LRU, LFU, TTL or custom eviction.
//! - [`shared`]: shared immutable, reader/writer and versioned values.
//! - [`mapping`]: typed, bounds-checked views of memory-mapped files.
//!
//! Every component reports structured events through a
//! [`telemetry::EventSink`] and logs through `tracing`.
//!
//! # Design Principles
//!
//! - **Explicit lifetimes**: every acquired resource is owned by a guard or
//!   handle, and release is observable.
//! - **No global state**: registries, pools and caches are values created
//!   per application scope.
//! - **Typed failures**: misuse returns an error; nothing aborts the process.

pub mod cache;
pub mod config;
pub mod error;
pub mod mapping;
pub mod pool;
pub mod resource;
pub mod shared;
pub mod shutdown;
pub mod telemetry;

use std::hash::Hash;
use std::path::Path;

pub use cache::{Cache, CacheConfig, CacheStats, EvictionPolicy, EvictionStrategy};
pub use config::CoreConfig;
pub use error::{CleanupError, CoreError, ErrorCategory, Result};
pub use mapping::{MappedElement, MappedView, MappingRules};
pub use pool::{ConnectionManager, Pool, PoolConfig, PoolStatus, PooledConnection};
pub use resource::{
    CleanupPriority, RegistryConfig, ResourceGuard, ResourceId, ResourceRegistry, ShutdownReport,
};
pub use shared::{ConcurrentMap, ConfigData, MutableSharedData, SharedData};
pub use shutdown::ShutdownState;
pub use telemetry::{EventSink, ResourceEvent, SharedSink};

/// One application scope: a registry plus the configuration every
/// component built from it uses.
pub struct CoreRuntime {
    config: CoreConfig,
    registry: ResourceRegistry,
    sink: SharedSink,
}

impl CoreRuntime {
    /// Validate `config` and start the registry on the current tokio runtime.
    pub fn start(config: CoreConfig, sink: SharedSink) -> Result<Self> {
        config.validate()?;
        let registry = ResourceRegistry::start(config.registry.clone(), sink.clone())?;
        tracing::info!("core runtime started");
        Ok(Self {
            config,
            registry,
            sink,
        })
    }

    /// Runtime with default configuration and the tracing sink.
    pub fn with_defaults() -> Result<Self> {
        Self::start(CoreConfig::default(), telemetry::default_sink())
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    pub fn sink(&self) -> &SharedSink {
        &self.sink
    }

    /// New cache using the configured cache settings.
    pub fn cache<K, V>(&self) -> Result<Cache<K, V>>
    where
        K: Hash + Eq + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        Cache::with_sink(self.config.cache.clone(), self.sink.clone())
    }

    /// New pool using the configured pool settings.
    pub async fn pool<M: ConnectionManager>(&self, manager: M) -> Result<Pool<M>> {
        Pool::with_sink(manager, self.config.pool.clone(), self.sink.clone()).await
    }

    /// Map `path` under the configured mapping rules. The mapping is
    /// tracked by this runtime's registry.
    pub fn open_mapped<T: MappedElement>(&self, path: impl AsRef<Path>) -> Result<MappedView<T>> {
        MappedView::open(&self.registry, path, &self.config.mapping)
    }

    /// Shut the registry down using the configured grace period.
    ///
    /// Pools and caches are owned by their callers and are not closed here.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.registry.shutdown().await
    }
}

impl std::fmt::Debug for CoreRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreRuntime")
            .field("registry", &self.registry)
            .finish()
    }
}
