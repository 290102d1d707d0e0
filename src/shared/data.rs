//! Shared immutable and reader/writer values.

use std::ops::Deref;
use std::sync::Arc;

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Immutable value shared by reference count. Cloning is O(1).
#[derive(Debug, Default)]
pub struct SharedData<T> {
    inner: Arc<T>,
}

impl<T> SharedData<T> {
    pub fn new(value: T) -> Self {
        Self { inner: Arc::new(value) }
    }

    /// Clone `value` once into shared storage.
    pub fn from_ref(value: &T) -> Self
    where
        T: Clone,
    {
        Self::new(value.clone())
    }

    /// True if both handles point at the same allocation.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Number of live handles.
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn as_arc(&self) -> &Arc<T> {
        &self.inner
    }
}

impl<T> Clone for SharedData<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Deref for SharedData<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> From<Arc<T>> for SharedData<T> {
    fn from(inner: Arc<T>) -> Self {
        Self { inner }
    }
}

/// Value shared behind an async reader/writer lock.
///
/// Any number of readers or one writer at a time. A writer's changes become
/// visible together when its guard drops.
#[derive(Debug, Default)]
pub struct MutableSharedData<T> {
    inner: Arc<RwLock<T>>,
}

impl<T> Clone for MutableSharedData<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> MutableSharedData<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(RwLock::new(value)),
        }
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, T> {
        self.inner.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.inner.write().await
    }

    /// Apply `f` under the write lock and return its result.
    pub async fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.inner.write().await;
        f(&mut guard)
    }

    /// Owned copy of the current value.
    pub async fn snapshot(&self) -> T
    where
        T: Clone,
    {
        self.inner.read().await.clone()
    }

    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}
