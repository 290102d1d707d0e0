//! Exclusive ownership of a resource and its one-shot cleanup action.

use std::sync::Weak;

use tracing::warn;

use super::id::ResourceId;
use super::priority::CleanupPriority;
use super::registry::{
    spawn_detached, CleanupFuture, DetachedCleanup, RegistryShared, FALLBACK_CLEANUP_TIMEOUT,
};
use crate::error::{CleanupError, CoreError, Result};
use crate::telemetry::{Component, EventSink, ResourceEvent, TracingSink};

/// Cleanup action bound to a guarded value.
pub(crate) type CleanupFn<T> = Box<dyn FnOnce(T) -> CleanupFuture + Send + Sync>;

/// Value and cleanup live and die together.
struct Armed<T> {
    value: T,
    cleanup: CleanupFn<T>,
}

/// Owns a value of type `T` and guarantees its cleanup action runs at most
/// once.
///
/// Consumption happens exactly once, in one of three ways:
/// - [`into_inner`](Self::into_inner) / [`take`](Self::take) extract the
///   value and disarm the cleanup;
/// - [`cleanup`](Self::cleanup) runs the action now;
/// - dropping the guard hands the action to the registry's scheduler.
///
/// Any access after consumption returns [`CoreError::ResourceConsumed`].
pub struct ResourceGuard<T: Send + 'static> {
    id: ResourceId,
    type_name: &'static str,
    priority: CleanupPriority,
    slot: Option<Armed<T>>,
    registry: Weak<RegistryShared>,
}

impl<T: Send + 'static> ResourceGuard<T> {
    pub(crate) fn armed(
        id: ResourceId,
        type_name: &'static str,
        priority: CleanupPriority,
        value: T,
        cleanup: CleanupFn<T>,
        registry: Weak<RegistryShared>,
    ) -> Self {
        Self {
            id,
            type_name,
            priority,
            slot: Some(Armed { value, cleanup }),
            registry,
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn priority(&self) -> CleanupPriority {
        self.priority
    }

    pub fn is_consumed(&self) -> bool {
        self.slot.is_none()
    }

    pub fn get(&self) -> Result<&T> {
        self.slot
            .as_ref()
            .map(|armed| &armed.value)
            .ok_or(CoreError::ResourceConsumed(self.id))
    }

    pub fn get_mut(&mut self) -> Result<&mut T> {
        let id = self.id;
        self.slot
            .as_mut()
            .map(|armed| &mut armed.value)
            .ok_or(CoreError::ResourceConsumed(id))
    }

    /// Extract the value and disarm the cleanup action.
    pub fn take(&mut self) -> Result<T> {
        let armed = self.slot.take().ok_or(CoreError::ResourceConsumed(self.id))?;
        if let Some(registry) = self.registry.upgrade() {
            registry.deregister(self.id);
        }
        Ok(armed.value)
    }

    /// Consume the guard, returning the value without running cleanup.
    pub fn into_inner(mut self) -> Result<T> {
        self.take()
    }

    /// Run the cleanup action now and wait for it.
    ///
    /// A second call reports `AlreadyCleanedUp` and has no side effect.
    pub async fn cleanup(&mut self) -> std::result::Result<(), CleanupError> {
        let Some(Armed { value, cleanup }) = self.slot.take() else {
            return Err(CleanupError::AlreadyCleanedUp(self.id));
        };
        let action = cleanup(value);
        match self.registry.upgrade() {
            Some(registry) => registry.execute_now(self.id, self.type_name, action).await,
            None => match tokio::time::timeout(FALLBACK_CLEANUP_TIMEOUT, action).await {
                Ok(result) => result,
                Err(_) => Err(CleanupError::Timeout {
                    id: self.id,
                    after: FALLBACK_CLEANUP_TIMEOUT,
                }),
            },
        }
    }
}

impl<T: Send + 'static> Drop for ResourceGuard<T> {
    fn drop(&mut self) {
        let Some(Armed { value, cleanup }) = self.slot.take() else {
            return;
        };
        let action = cleanup(value);

        let registry = self.registry.upgrade();
        let action = match &registry {
            Some(registry) => {
                match registry.submit(self.id, self.type_name, self.priority, action) {
                    Ok(()) => return,
                    Err(action) => action,
                }
            }
            None => action,
        };

        // The registry is gone or shutting down. Report it, then make the
        // single cleanup attempt on a detached task if a runtime is around.
        let id = self.id;
        let type_name = self.type_name;
        let timeout = registry
            .as_ref()
            .map(|r| r.cleanup_timeout())
            .unwrap_or(FALLBACK_CLEANUP_TIMEOUT);
        let sink: std::sync::Arc<dyn EventSink> = match &registry {
            Some(registry) => {
                registry.forget(id);
                registry.sink().clone()
            }
            None => std::sync::Arc::new(TracingSink),
        };
        sink.record(
            ResourceEvent::new(Component::Registry, "abandon")
                .resource(id)
                .success(false)
                .context(CleanupError::ShuttingDown.to_string()),
        );
        drop(registry);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let batch = vec![DetachedCleanup { id, type_name, action }];
                spawn_detached(&handle, batch, timeout, sink);
            }
            Err(_) => {
                warn!(resource_id = %id, type_name, "no runtime for cleanup, value dropped");
            }
        }
    }
}

impl<T: Send + std::fmt::Debug + 'static> std::fmt::Debug for ResourceGuard<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGuard")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("value", &self.slot.as_ref().map(|armed| &armed.value))
            .finish()
    }
}
