//! Metrics facade helpers.
//!
//! Thin wrappers over the `metrics` crate so metric names and labels stay
//! consistent across components. Without an installed recorder these are
//! no-ops.

use std::time::Duration;

use ::metrics::{counter, gauge, histogram};

/// Count and time any structured event.
pub fn record_event(component: &'static str, operation: &str, success: bool, duration: Duration) {
    let outcome = if success { "ok" } else { "error" };
    counter!(
        "core_resources_events_total",
        "component" => component,
        "operation" => operation.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    histogram!(
        "core_resources_event_duration_seconds",
        "component" => component,
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record one executed cleanup action.
pub fn record_cleanup(outcome: &'static str, duration: Duration) {
    counter!("core_resources_cleanup_total", "outcome" => outcome).increment(1);
    histogram!("core_resources_cleanup_duration_seconds").record(duration.as_secs_f64());
}

/// Record the registry's queue depth and tracked resource count.
pub fn record_registry_depth(pending: usize, tracked: usize) {
    gauge!("core_resources_registry_pending").set(pending as f64);
    gauge!("core_resources_registry_tracked").set(tracked as f64);
}

/// Record a pool acquisition attempt.
pub fn record_pool_acquire(success: bool, wait: Duration) {
    let outcome = if success { "ok" } else { "error" };
    counter!("core_resources_pool_acquire_total", "outcome" => outcome).increment(1);
    histogram!("core_resources_pool_acquire_wait_seconds").record(wait.as_secs_f64());
}

/// Record the pool's occupancy.
pub fn record_pool_status(idle: usize, in_use: usize, waiters: usize) {
    gauge!("core_resources_pool_idle").set(idle as f64);
    gauge!("core_resources_pool_in_use").set(in_use as f64);
    gauge!("core_resources_pool_waiters").set(waiters as f64);
}

/// Record a cache lookup.
pub fn record_cache_access(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    counter!("core_resources_cache_lookups_total", "result" => result).increment(1);
}

/// Record removal of cache entries (`reason` is "capacity", "expired" or "invalidated").
pub fn record_cache_eviction(reason: &'static str, count: u64) {
    counter!("core_resources_cache_evictions_total", "reason" => reason).increment(count);
}
