//! Central tracking and cleanup scheduling for guarded resources.
//!
//! Every [`ResourceGuard`] is registered here. A guard dropped without being
//! consumed hands its cleanup future to the registry, which executes queued
//! cleanups from a background task in (priority, submission) order. The
//! scheduler is the only place scope-exit cleanup actually runs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use super::guard::ResourceGuard;
use super::id::ResourceId;
use super::priority::{CleanupPriority, CleanupQueue};
use crate::error::{CleanupError, CoreError, Result};
use crate::shutdown::{ShutdownCoordinator, ShutdownState};
use crate::telemetry::{
    self, default_sink, Component, ResourceEvent, ResourceSpan, SharedSink, SpanExt,
};

/// Boxed cleanup work handed to the scheduler.
pub(crate) type CleanupFuture = BoxFuture<'static, std::result::Result<(), CleanupError>>;

/// Timeout applied to cleanups that run without a live registry.
pub(crate) const FALLBACK_CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Cleanup work that outlived the scheduler meant to run it.
pub(crate) struct DetachedCleanup {
    pub(crate) id: ResourceId,
    pub(crate) type_name: &'static str,
    pub(crate) action: CleanupFuture,
}

/// Run `batch` in order on a task of its own, each action bounded by
/// `timeout`. Every outcome is reported as a `detached_cleanup` event.
pub(crate) fn spawn_detached(
    handle: &Handle,
    batch: Vec<DetachedCleanup>,
    timeout: Duration,
    sink: SharedSink,
) {
    handle.spawn(async move {
        for DetachedCleanup { id, type_name, action } in batch {
            let started = Instant::now();
            let result = match tokio::time::timeout(timeout, action).await {
                Ok(result) => result,
                Err(_) => Err(CleanupError::Timeout { id, after: timeout }),
            };
            let event = ResourceEvent::new(Component::Registry, "detached_cleanup")
                .resource(id)
                .duration(started.elapsed());
            match result {
                Ok(()) => sink.record(event.context(type_name)),
                Err(err) => {
                    warn!(resource_id = %id, type_name, error = %err, "detached cleanup failed");
                    sink.record(event.success(false).context(err.to_string()));
                }
            }
        }
    });
}

/// Registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Interval of the background scheduler tick.
    #[serde(with = "crate::config::duration_ms")]
    pub tick_interval: Duration,
    /// Upper bound for a single cleanup action.
    #[serde(with = "crate::config::duration_ms")]
    pub cleanup_timeout: Duration,
    /// Time `shutdown` spends draining the queue before abandoning the rest.
    #[serde(with = "crate::config::duration_ms")]
    pub shutdown_grace: Duration,
    /// Maximum cleanups executed per tick.
    pub batch_size: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(50),
            cleanup_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(10),
            batch_size: 64,
        }
    }
}

/// Tracking state of a registered resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    /// Held by a live guard.
    Live,
    /// Guard dropped, cleanup queued or executing.
    PendingCleanup,
}

/// Metadata kept for every tracked resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub id: ResourceId,
    pub type_name: String,
    pub priority: CleanupPriority,
    pub registered_at: DateTime<Utc>,
    pub state: ResourceState,
}

/// Counters exposed by [`ResourceRegistry::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub tracked: usize,
    pub pending: usize,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub abandoned: u64,
}

/// Outcome of a bulk cleanup pass.
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub completed: Vec<ResourceId>,
    pub failed: Vec<(ResourceId, CleanupError)>,
}

/// Outcome of [`ResourceRegistry::shutdown`].
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Cleanups that finished successfully during the drain.
    pub completed: Vec<ResourceId>,
    /// Cleanups that ran during the drain and failed or timed out.
    pub failed: Vec<(ResourceId, CleanupError)>,
    /// Cleanups still queued when the grace period ran out.
    pub abandoned: Vec<ResourceId>,
    /// Resources whose guards were still alive at shutdown.
    pub still_held: Vec<ResourceId>,
}

impl ShutdownReport {
    /// True when nothing was abandoned or failed.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.abandoned.is_empty()
    }
}

struct CleanupRequest {
    id: ResourceId,
    type_name: &'static str,
    submitted_at: Instant,
    action: CleanupFuture,
}

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    abandoned: AtomicU64,
}

pub(crate) struct RegistryShared {
    config: RegistryConfig,
    resources: DashMap<ResourceId, ResourceInfo>,
    pending: Mutex<CleanupQueue<CleanupRequest>>,
    /// Serializes execution so queue order is execution order.
    executor: tokio::sync::Mutex<()>,
    lifecycle: ShutdownCoordinator,
    wake: Arc<Notify>,
    cancel: CancellationToken,
    sink: SharedSink,
    counters: Counters,
}

impl RegistryShared {
    pub(crate) fn sink(&self) -> &SharedSink {
        &self.sink
    }

    pub(crate) fn cleanup_timeout(&self) -> Duration {
        self.config.cleanup_timeout
    }

    fn register(&self, type_name: &'static str, priority: CleanupPriority) -> Result<ResourceId> {
        if !self.lifecycle.is_accepting() {
            return Err(CoreError::ShuttingDown);
        }
        let id = ResourceId::next();
        self.resources.insert(
            id,
            ResourceInfo {
                id,
                type_name: type_name.to_string(),
                priority,
                registered_at: Utc::now(),
                state: ResourceState::Live,
            },
        );
        self.sink.record(
            ResourceEvent::new(Component::Registry, "register")
                .resource(id)
                .context(type_name),
        );
        Ok(id)
    }

    /// Forget a resource whose value was extracted.
    pub(crate) fn deregister(&self, id: ResourceId) {
        if self.resources.remove(&id).is_some() {
            self.sink.record(ResourceEvent::new(Component::Registry, "deregister").resource(id));
        }
    }

    /// Stop tracking a resource whose cleanup left the registry's hands.
    pub(crate) fn forget(&self, id: ResourceId) {
        self.resources.remove(&id);
    }

    /// Queue a scope-exit cleanup. Hands the future back if the registry no
    /// longer accepts work.
    pub(crate) fn submit(
        &self,
        id: ResourceId,
        type_name: &'static str,
        priority: CleanupPriority,
        action: CleanupFuture,
    ) -> std::result::Result<(), CleanupFuture> {
        {
            let mut pending = self.pending.lock();
            if !self.lifecycle.is_accepting() {
                return Err(action);
            }
            pending.push(
                CleanupRequest {
                    id,
                    type_name,
                    submitted_at: Instant::now(),
                    action,
                },
                priority,
            );
        }
        if let Some(mut info) = self.resources.get_mut(&id) {
            info.state = ResourceState::PendingCleanup;
        }
        self.sink.record(ResourceEvent::new(Component::Registry, "schedule").resource(id));
        self.wake.notify_one();
        Ok(())
    }

    /// Run a cleanup immediately, bypassing the queue (explicit cleanup).
    pub(crate) async fn execute_now(
        &self,
        id: ResourceId,
        type_name: &'static str,
        action: CleanupFuture,
    ) -> std::result::Result<(), CleanupError> {
        let request = CleanupRequest {
            id,
            type_name,
            submitted_at: Instant::now(),
            action,
        };
        self.execute(request, self.config.cleanup_timeout).await
    }

    async fn execute(
        &self,
        request: CleanupRequest,
        limit: Duration,
    ) -> std::result::Result<(), CleanupError> {
        let CleanupRequest { id, type_name, submitted_at, action } = request;
        let started = Instant::now();
        let span = ResourceSpan::for_resource("registry", "cleanup", id);
        let result = match tokio::time::timeout(limit, action).instrument(span.clone()).await {
            Ok(result) => result,
            Err(_) => Err(CleanupError::Timeout { id, after: limit }),
        };
        span.record_result(&result);
        let elapsed = started.elapsed();
        self.resources.remove(&id);

        let event = ResourceEvent::new(Component::Registry, "cleanup")
            .resource(id)
            .duration(elapsed);
        match &result {
            Ok(()) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                telemetry::record_cleanup("ok", elapsed);
                debug!(
                    resource_id = %id,
                    type_name,
                    queued_ms = submitted_at.elapsed().as_millis() as u64,
                    "cleanup complete"
                );
                self.sink.record(event.context(type_name));
            }
            Err(err) => {
                if err.is_retryable() {
                    self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                }
                telemetry::record_cleanup(err.outcome(), elapsed);
                warn!(resource_id = %id, type_name, error = %err, "cleanup failed");
                self.sink.record(event.success(false).context(err.to_string()));
            }
        }
        result
    }

    fn pop_pending(&self) -> Option<CleanupRequest> {
        self.pending.lock().pop()
    }

    async fn run_batch(&self) -> usize {
        let _exec = self.executor.lock().await;
        let mut executed = 0;
        while executed < self.config.batch_size {
            let Some(request) = self.pop_pending() else {
                break;
            };
            // Failures are reported through events; the scheduler keeps going.
            let _ = self.execute(request, self.config.cleanup_timeout).await;
            executed += 1;
        }
        telemetry::record_registry_depth(self.pending.lock().len(), self.resources.len());
        executed
    }

    fn abandon(&self, request: CleanupRequest) -> ResourceId {
        let id = request.id;
        self.resources.remove(&id);
        self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
        warn!(resource_id = %id, type_name = request.type_name, "cleanup abandoned");
        self.sink.record(
            ResourceEvent::new(Component::Registry, "abandon")
                .resource(id)
                .success(false)
                .context(request.type_name),
        );
        // Dropping the future drops the captured value.
        drop(request.action);
        id
    }
}

impl Drop for RegistryShared {
    fn drop(&mut self) {
        self.cancel.cancel();
        let leftover = self.pending.get_mut().drain_ordered();
        if leftover.is_empty() {
            return;
        }
        match Handle::try_current() {
            Ok(handle) => {
                debug!(queued = leftover.len(), "registry dropped, running queued cleanups detached");
                let batch = leftover
                    .into_iter()
                    .map(|request| DetachedCleanup {
                        id: request.id,
                        type_name: request.type_name,
                        action: request.action,
                    })
                    .collect();
                spawn_detached(&handle, batch, self.config.cleanup_timeout, self.sink.clone());
            }
            Err(_) => {
                for request in leftover {
                    self.abandon(request);
                }
            }
        }
    }
}

/// Handle to a resource registry. Clones share the same registry.
#[derive(Clone)]
pub struct ResourceRegistry {
    shared: Arc<RegistryShared>,
}

impl ResourceRegistry {
    /// Create a registry and spawn its cleanup scheduler on the current
    /// tokio runtime.
    ///
    /// Fails with `NoRuntime` when called outside a runtime.
    pub fn start(config: RegistryConfig, sink: SharedSink) -> Result<Self> {
        let handle =
            Handle::try_current().map_err(|_| CoreError::NoRuntime("the cleanup scheduler"))?;
        let cancel = CancellationToken::new();
        let wake = Arc::new(Notify::new());
        let tick = config.tick_interval.max(Duration::from_millis(1));
        let shared = Arc::new(RegistryShared {
            config,
            resources: DashMap::new(),
            pending: Mutex::new(CleanupQueue::new()),
            executor: tokio::sync::Mutex::new(()),
            lifecycle: ShutdownCoordinator::new(),
            wake: wake.clone(),
            cancel: cancel.clone(),
            sink,
            counters: Counters::default(),
        });

        handle.spawn(run_scheduler(Arc::downgrade(&shared), wake, cancel, tick));
        info!("resource registry started");

        Ok(Self { shared })
    }

    /// Registry with default configuration and the tracing sink.
    pub fn with_defaults() -> Result<Self> {
        Self::start(RegistryConfig::default(), default_sink())
    }

    pub(crate) fn downgrade(&self) -> Weak<RegistryShared> {
        Arc::downgrade(&self.shared)
    }

    /// Wrap `value` in a guard whose drop schedules `cleanup`.
    pub fn guard<T, F, Fut>(
        &self,
        value: T,
        priority: CleanupPriority,
        cleanup: F,
    ) -> Result<ResourceGuard<T>>
    where
        T: Send + 'static,
        F: FnOnce(T) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<(), CleanupError>> + Send + 'static,
    {
        let type_name = std::any::type_name::<T>();
        let id = self.shared.register(type_name, priority)?;
        let action = Box::new(move |value: T| cleanup(value).boxed());
        Ok(ResourceGuard::armed(
            id,
            type_name,
            priority,
            value,
            action,
            self.downgrade(),
        ))
    }

    /// Like [`guard`](Self::guard) for cleanups that do not suspend.
    pub fn guard_sync<T, F>(
        &self,
        value: T,
        priority: CleanupPriority,
        cleanup: F,
    ) -> Result<ResourceGuard<T>>
    where
        T: Send + 'static,
        F: FnOnce(T) -> std::result::Result<(), CleanupError> + Send + Sync + 'static,
    {
        self.guard(value, priority, move |value| futures::future::lazy(move |_| cleanup(value)))
    }

    /// Remove a queued cleanup and run it now.
    ///
    /// Ids with nothing queued report `AlreadyCleanedUp`; ids whose guards
    /// are still alive report `NotPending`.
    pub async fn force_cleanup(&self, id: ResourceId) -> std::result::Result<(), CleanupError> {
        let shared = &self.shared;
        let _exec = shared.executor.lock().await;
        let request = shared.pending.lock().remove_first(|r| r.id == id);
        match request {
            Some(request) => shared.execute(request, shared.config.cleanup_timeout).await,
            None if shared
                .resources
                .get(&id)
                .is_some_and(|info| info.state == ResourceState::Live) =>
            {
                Err(CleanupError::NotPending(id))
            }
            None => Err(CleanupError::AlreadyCleanedUp(id)),
        }
    }

    /// Execute every queued cleanup now, in order.
    pub async fn run_pending(&self) -> CleanupReport {
        let shared = &self.shared;
        let _exec = shared.executor.lock().await;
        let mut report = CleanupReport::default();
        while let Some(request) = shared.pop_pending() {
            let id = request.id;
            match shared.execute(request, shared.config.cleanup_timeout).await {
                Ok(()) => report.completed.push(id),
                Err(err) => report.failed.push((id, err)),
            }
        }
        report
    }

    /// Stop accepting work, drain the queue for the configured grace period
    /// and report what could not be cleaned up.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.shutdown_with_grace(self.shared.config.shutdown_grace).await
    }

    /// [`shutdown`](Self::shutdown) with an explicit grace period.
    pub async fn shutdown_with_grace(&self, grace: Duration) -> ShutdownReport {
        let shared = &self.shared;
        {
            let _pending = shared.pending.lock();
            if !shared.lifecycle.begin_drain() {
                return ShutdownReport::default();
            }
        }
        shared.cancel.cancel();
        info!(grace_ms = grace.as_millis() as u64, "resource registry draining");

        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + grace;
        let mut report = ShutdownReport::default();

        if let Ok(_exec) = tokio::time::timeout_at(deadline, shared.executor.lock()).await {
            loop {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    break;
                }
                let Some(request) = shared.pop_pending() else {
                    break;
                };
                let id = request.id;
                let limit = remaining.min(shared.config.cleanup_timeout);
                match shared.execute(request, limit).await {
                    Ok(()) => report.completed.push(id),
                    Err(err) => report.failed.push((id, err)),
                }
            }
        }

        let leftover = shared.pending.lock().drain_ordered();
        for request in leftover {
            report.abandoned.push(shared.abandon(request));
        }
        report.still_held = shared.resources.iter().map(|e| *e.key()).collect();
        report.still_held.sort();

        shared.lifecycle.finish();
        shared.sink.record(
            ResourceEvent::new(Component::Registry, "shutdown")
                .duration(started.elapsed())
                .success(report.is_clean())
                .context(format!(
                    "completed={} failed={} abandoned={} still_held={}",
                    report.completed.len(),
                    report.failed.len(),
                    report.abandoned.len(),
                    report.still_held.len()
                )),
        );
        info!(
            completed = report.completed.len(),
            failed = report.failed.len(),
            abandoned = report.abandoned.len(),
            still_held = report.still_held.len(),
            "resource registry stopped"
        );
        report
    }

    pub fn state(&self) -> ShutdownState {
        self.shared.lifecycle.state()
    }

    pub fn is_accepting(&self) -> bool {
        self.shared.lifecycle.is_accepting()
    }

    /// Metadata for a tracked resource.
    pub fn info(&self, id: ResourceId) -> Option<ResourceInfo> {
        self.shared.resources.get(&id).map(|info| info.clone())
    }

    /// Ids of every tracked resource, sorted.
    pub fn outstanding(&self) -> Vec<ResourceId> {
        let mut ids: Vec<_> = self.shared.resources.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    /// Number of queued cleanups.
    pub fn pending(&self) -> usize {
        self.shared.pending.lock().len()
    }

    pub fn stats(&self) -> RegistryStats {
        let counters = &self.shared.counters;
        RegistryStats {
            tracked: self.shared.resources.len(),
            pending: self.pending(),
            completed: counters.completed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            timed_out: counters.timed_out.load(Ordering::Relaxed),
            abandoned: counters.abandoned.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.shared.config
    }
}

impl std::fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("state", &self.state())
            .field("tracked", &self.shared.resources.len())
            .field("pending", &self.pending())
            .finish()
    }
}

async fn run_scheduler(
    shared: Weak<RegistryShared>,
    wake: Arc<Notify>,
    cancel: CancellationToken,
    tick: Duration,
) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
            _ = wake.notified() => {}
        }
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.run_batch().await;
    }
    debug!("cleanup scheduler exited");
}
