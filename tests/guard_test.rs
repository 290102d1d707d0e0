//! Tests for resource guard consumption rules.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use core_resources::error::{CleanupError, CoreError, ErrorCategory};
use core_resources::resource::{CleanupPriority, RegistryConfig, ResourceRegistry};
use core_resources::telemetry::CollectingSink;

fn registry() -> ResourceRegistry {
    ResourceRegistry::start(
        RegistryConfig {
            tick_interval: Duration::from_secs(3600),
            ..RegistryConfig::default()
        },
        CollectingSink::new(),
    )
    .unwrap()
}

fn counting_guard(
    registry: &ResourceRegistry,
    calls: &Arc<AtomicUsize>,
) -> core_resources::ResourceGuard<Vec<u8>> {
    let calls = calls.clone();
    registry
        .guard(vec![0u8; 16], CleanupPriority::Normal, move |buf| async move {
            assert_eq!(buf.len(), 16);
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap()
}

#[tokio::test]
async fn test_each_guard_gets_a_distinct_id() {
    let registry = registry();
    let a = registry.guard_sync(1u8, CleanupPriority::Low, |_| Ok(())).unwrap();
    let b = registry.guard_sync(2u8, CleanupPriority::Low, |_| Ok(())).unwrap();
    assert_ne!(a.id(), b.id());
    assert!(a.id() < b.id());
    assert_eq!(registry.outstanding(), vec![a.id(), b.id()]);
}

#[tokio::test]
async fn test_mutation_through_guard() {
    let registry = registry();
    let mut guard = registry
        .guard_sync(Vec::<u32>::new(), CleanupPriority::Normal, |_| Ok(()))
        .unwrap();
    guard.get_mut().unwrap().extend([1, 2, 3]);
    assert_eq!(guard.get().unwrap().as_slice(), &[1, 2, 3]);
    assert_eq!(guard.priority(), CleanupPriority::Normal);
}

#[tokio::test]
async fn test_take_skips_cleanup() {
    let registry = registry();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut guard = counting_guard(&registry, &calls);
    let value = guard.take().unwrap();
    assert_eq!(value.len(), 16);
    drop(guard);

    assert!(registry.run_pending().await.completed.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(registry.outstanding().is_empty());
}

#[tokio::test]
async fn test_cleanup_then_drop_runs_once() {
    let registry = registry();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut guard = counting_guard(&registry, &calls);
    guard.cleanup().await.unwrap();
    assert!(guard.is_consumed());
    drop(guard);
    registry.run_pending().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_consumed_access_maps_to_not_found() {
    let registry = registry();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut guard = counting_guard(&registry, &calls);
    guard.cleanup().await.unwrap();

    let err = guard.get().unwrap_err();
    assert!(matches!(err, CoreError::ResourceConsumed(id) if id == guard.id()));
    assert_eq!(err.category(), ErrorCategory::NotFound);
    assert_eq!(
        guard.cleanup().await,
        Err(CleanupError::AlreadyCleanedUp(guard.id()))
    );
}

#[tokio::test]
async fn test_explicit_cleanup_without_registry() {
    let registry = registry();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut guard = counting_guard(&registry, &calls);
    drop(registry);

    guard.cleanup().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_drop_without_runtime_does_not_panic() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let registry = runtime.block_on(async { registry() });
    let calls = Arc::new(AtomicUsize::new(0));
    let guard = counting_guard(&registry, &calls);
    drop(runtime);
    drop(registry);
    drop(guard);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}
