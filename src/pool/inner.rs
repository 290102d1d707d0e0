//! Shared pool state and the acquire/release machinery.
//!
//! All counts live under one `parking_lot` mutex. The lock is never held
//! across an await, and no `PooledConnection` or armed `CreatePermit` is
//! dropped while it is held: their drops re-enter the pool.

use std::collections::VecDeque;
use std::sync::Weak;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use super::config::PoolConfig;
use super::connection::{Conn, CreatePermit, Handoff, PooledConnection};
use super::manager::ConnectionManager;
use crate::error::{CoreError, Result};
use crate::shutdown::{DrainResult, ShutdownCoordinator, ShutdownState};
use crate::telemetry::{self, Component, ResourceEvent, ResourceSpan, SharedSink, SpanExt};

/// Point-in-time occupancy of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub idle: usize,
    pub in_use: usize,
    /// Idle, checked out, and being created or validated.
    pub total: usize,
    pub waiters: usize,
    pub max_size: usize,
    pub min_size: usize,
}

struct Waiter<M: ConnectionManager> {
    id: u64,
    tx: oneshot::Sender<Handoff<M>>,
}

struct PoolState<M: ConnectionManager> {
    // Most recently returned at the front.
    idle: VecDeque<Conn<M::Connection>>,
    in_use: usize,
    total: usize,
    waiters: VecDeque<Waiter<M>>,
    next_waiter_id: u64,
}

enum Step<M: ConnectionManager> {
    Check(Conn<M::Connection>),
    Create(CreatePermit<M>),
    Wait(u64, oneshot::Receiver<Handoff<M>>),
}

pub(crate) struct PoolInner<M: ConnectionManager> {
    weak_self: Weak<PoolInner<M>>,
    manager: M,
    config: PoolConfig,
    state: Mutex<PoolState<M>>,
    lifecycle: ShutdownCoordinator,
    pub(crate) cancel: CancellationToken,
    sink: SharedSink,
}

impl<M: ConnectionManager> PoolInner<M> {
    pub(crate) fn new(
        weak_self: Weak<PoolInner<M>>,
        manager: M,
        config: PoolConfig,
        sink: SharedSink,
    ) -> Self {
        let state = PoolState {
            idle: VecDeque::with_capacity(config.max_size),
            in_use: 0,
            total: 0,
            waiters: VecDeque::new(),
            next_waiter_id: 0,
        };
        Self {
            weak_self,
            manager,
            config,
            state: Mutex::new(state),
            lifecycle: ShutdownCoordinator::new(),
            cancel: CancellationToken::new(),
            sink,
        }
    }

    pub(crate) fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub(crate) fn manager(&self) -> &M {
        &self.manager
    }

    pub(crate) fn lifecycle_state(&self) -> ShutdownState {
        self.lifecycle.state()
    }

    pub(crate) fn status(&self) -> PoolStatus {
        let state = self.state.lock();
        PoolStatus {
            idle: state.idle.len(),
            in_use: state.in_use,
            total: state.total,
            waiters: state.waiters.len(),
            max_size: self.config.max_size,
            min_size: self.config.min_size,
        }
    }

    fn publish_status(&self) {
        let status = self.status();
        telemetry::record_pool_status(status.idle, status.in_use, status.waiters);
    }

    pub(crate) async fn acquire(&self, timeout: Duration) -> Result<PooledConnection<M>> {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;
        let span = ResourceSpan::new("pool", "acquire");
        let result = self
            .acquire_until(deadline, timeout)
            .instrument(span.clone())
            .await;
        span.record_result(&result);

        let waited = started.elapsed();
        telemetry::record_pool_acquire(result.is_ok(), waited);
        let event = ResourceEvent::new(Component::Pool, "acquire").duration(waited);
        match &result {
            Ok(_) => self.sink.record(event),
            Err(err) => {
                debug!(error = %err, waited_ms = waited.as_millis() as u64, "pool acquire failed");
                self.sink.record(event.success(false).context(err.to_string()));
            }
        }
        result
    }

    async fn acquire_until(
        &self,
        deadline: tokio::time::Instant,
        timeout: Duration,
    ) -> Result<PooledConnection<M>> {
        loop {
            let step = {
                let mut state = self.state.lock();
                if !self.lifecycle.is_accepting() {
                    return Err(CoreError::ShuttingDown);
                }
                if state.waiters.is_empty() {
                    if let Some(conn) = state.idle.pop_front() {
                        state.in_use += 1;
                        Step::Check(conn)
                    } else if state.total < self.config.max_size {
                        state.total += 1;
                        Step::Create(CreatePermit::new(self.weak_self.clone()))
                    } else {
                        Self::enqueue(&mut state)
                    }
                } else {
                    Self::enqueue(&mut state)
                }
            };

            match step {
                Step::Check(conn) => {
                    if let Some(conn) = self.check_out_idle(conn).await {
                        return Ok(conn);
                    }
                }
                Step::Create(permit) => return self.open(permit, deadline, timeout).await,
                Step::Wait(id, rx) => {
                    let _waiting = WaiterGuard { pool: self, id };
                    return match tokio::time::timeout_at(deadline, rx).await {
                        Err(_) => Err(CoreError::AcquireTimeout(timeout)),
                        // Sender dropped: the pool closed while we waited.
                        Ok(Err(_)) => Err(CoreError::ShuttingDown),
                        Ok(Ok(Handoff::Connection(conn))) => Ok(conn),
                        Ok(Ok(Handoff::Permit(permit))) => {
                            self.open(permit, deadline, timeout).await
                        }
                    };
                }
            }
        }
    }

    /// Check out a connection without queueing behind other callers.
    ///
    /// Fails with `Exhausted` when nothing is idle and the pool is at
    /// `max_size`, or when earlier callers are already waiting.
    pub(crate) async fn try_acquire(&self) -> Result<PooledConnection<M>> {
        let timeout = self.config.acquire_timeout;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let step = {
                let mut state = self.state.lock();
                if !self.lifecycle.is_accepting() {
                    return Err(CoreError::ShuttingDown);
                }
                if !state.waiters.is_empty() {
                    None
                } else if let Some(conn) = state.idle.pop_front() {
                    state.in_use += 1;
                    Some(Step::Check(conn))
                } else if state.total < self.config.max_size {
                    state.total += 1;
                    Some(Step::Create(CreatePermit::new(self.weak_self.clone())))
                } else {
                    None
                }
            };

            match step {
                Some(Step::Check(conn)) => {
                    if let Some(conn) = self.check_out_idle(conn).await {
                        self.sink.record(ResourceEvent::new(Component::Pool, "try_acquire"));
                        return Ok(conn);
                    }
                }
                Some(Step::Create(permit)) => {
                    let result = self.open(permit, deadline, timeout).await;
                    self.sink.record(
                        ResourceEvent::new(Component::Pool, "try_acquire").success(result.is_ok()),
                    );
                    return result;
                }
                Some(Step::Wait(..)) | None => {
                    let status = self.status();
                    let err = CoreError::Exhausted(format!(
                        "pool at capacity (in_use={}, max_size={}, waiters={})",
                        status.in_use, status.max_size, status.waiters
                    ));
                    debug!(error = %err, "pool try_acquire refused");
                    self.sink.record(
                        ResourceEvent::new(Component::Pool, "try_acquire")
                            .success(false)
                            .context(err.to_string()),
                    );
                    return Err(err);
                }
            }
        }
    }

    fn enqueue(state: &mut PoolState<M>) -> Step<M> {
        let id = state.next_waiter_id;
        state.next_waiter_id += 1;
        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(Waiter { id, tx });
        Step::Wait(id, rx)
    }

    /// Validate an idle connection already counted as in use.
    async fn check_out_idle(&self, conn: Conn<M::Connection>) -> Option<PooledConnection<M>> {
        if self.past_lifetime(&conn) {
            self.state.lock().in_use -= 1;
            self.discard(conn, "max_lifetime");
            return None;
        }
        // Wrapped first so a cancelled acquire still returns the connection.
        let mut pooled = PooledConnection::new(conn, self.weak_self.clone());
        let checked = self.manager.is_valid(&mut *pooled).await;
        let reason = match checked {
            Ok(true) => return Some(pooled),
            Ok(false) => "invalid",
            Err(err) => {
                debug!(error = %err, "idle connection failed health check");
                "health_check_error"
            }
        };
        let conn = pooled.into_conn()?;
        self.state.lock().in_use -= 1;
        self.discard(conn, reason);
        None
    }

    async fn open(
        &self,
        permit: CreatePermit<M>,
        deadline: tokio::time::Instant,
        timeout: Duration,
    ) -> Result<PooledConnection<M>> {
        let started = Instant::now();
        match tokio::time::timeout_at(deadline, self.manager.create()).await {
            Ok(Ok(raw)) => {
                self.sink
                    .record(ResourceEvent::new(Component::Pool, "create").duration(started.elapsed()));
                Ok(permit.fulfill(raw))
            }
            Ok(Err(err)) => {
                warn!(error = %err, "connection create failed");
                self.sink.record(
                    ResourceEvent::new(Component::Pool, "create")
                        .duration(started.elapsed())
                        .success(false)
                        .context(err.to_string()),
                );
                drop(permit);
                Err(CoreError::connection(err))
            }
            Err(_) => Err(CoreError::AcquireTimeout(timeout)),
        }
    }

    fn past_lifetime(&self, conn: &Conn<M::Connection>) -> bool {
        self.config
            .max_lifetime
            .is_some_and(|limit| conn.created_at.elapsed() >= limit)
    }

    /// A checked-out connection came back.
    pub(crate) fn release(&self, conn: Conn<M::Connection>) {
        self.state.lock().in_use -= 1;
        if !self.lifecycle.is_accepting() {
            self.discard(conn, "closed");
            return;
        }
        match Handle::try_current() {
            Ok(handle) => {
                let in_flight = self.lifecycle.track_always();
                let pool = self.weak_self.clone();
                handle.spawn(async move {
                    let _in_flight = in_flight;
                    if let Some(pool) = pool.upgrade() {
                        pool.revalidate(conn).await;
                    }
                });
            }
            // Outside a runtime the connection goes straight back.
            Err(_) => self.return_conn(conn),
        }
    }

    async fn revalidate(&self, mut conn: Conn<M::Connection>) {
        if self.past_lifetime(&conn) {
            self.discard(conn, "max_lifetime");
            self.spawn_replenish();
            return;
        }
        match self.manager.is_valid(&mut conn.raw).await {
            Ok(true) => {}
            Ok(false) => {
                self.discard(conn, "invalid");
                self.spawn_replenish();
                return;
            }
            Err(err) => {
                debug!(error = %err, "released connection failed validation");
                self.discard(conn, "health_check_error");
                self.spawn_replenish();
                return;
            }
        }

        let Conn { raw, created_at, .. } = conn;
        match self.manager.recycle(raw).await {
            Ok(raw) => self.return_conn(Conn {
                raw,
                created_at,
                idle_since: Instant::now(),
            }),
            Err(err) => {
                warn!(error = %err, "connection recycle failed");
                self.forget_slot("recycle_failed");
                self.spawn_replenish();
            }
        }
    }

    /// Hand a healthy connection to the oldest waiter, or park it idle.
    fn return_conn(&self, conn: Conn<M::Connection>) {
        let mut state = self.state.lock();
        if !self.lifecycle.is_accepting() {
            state.total -= 1;
            drop(state);
            drop(conn);
            return;
        }
        if let Some(conn) = self.dispatch_locked(&mut state, conn) {
            state.idle.push_front(conn);
        }
    }

    /// Give `conn` to the first waiter still listening. Returns it when
    /// nobody takes it.
    fn dispatch_locked(
        &self,
        state: &mut PoolState<M>,
        mut conn: Conn<M::Connection>,
    ) -> Option<Conn<M::Connection>> {
        while let Some(waiter) = state.waiters.pop_front() {
            state.in_use += 1;
            let handoff = Handoff::Connection(PooledConnection::new(conn, self.weak_self.clone()));
            match waiter.tx.send(handoff) {
                Ok(()) => return None,
                Err(Handoff::Connection(returned)) => {
                    state.in_use -= 1;
                    conn = returned.into_conn()?;
                }
                // Never sent from here.
                Err(Handoff::Permit(mut permit)) => {
                    permit.disarm();
                    return None;
                }
            }
        }
        Some(conn)
    }

    /// Turn free capacity into creation permits for queued waiters.
    fn grant_capacity_locked(&self, state: &mut PoolState<M>) {
        while state.total < self.config.max_size {
            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };
            state.total += 1;
            let permit = CreatePermit::new(self.weak_self.clone());
            if let Err(Handoff::Permit(mut permit)) = waiter.tx.send(Handoff::Permit(permit)) {
                permit.disarm();
                state.total -= 1;
            }
        }
    }

    /// Close a connection and free its slot.
    fn discard(&self, conn: Conn<M::Connection>, reason: &'static str) {
        drop(conn);
        self.forget_slot(reason);
    }

    fn forget_slot(&self, reason: &'static str) {
        {
            let mut state = self.state.lock();
            state.total -= 1;
            self.grant_capacity_locked(&mut state);
        }
        debug!(reason, "connection discarded");
        self.sink
            .record(ResourceEvent::new(Component::Pool, "discard").context(reason));
    }

    pub(crate) fn mark_checked_out(&self) {
        self.state.lock().in_use += 1;
    }

    pub(crate) fn forget_checked_out(&self) {
        {
            let mut state = self.state.lock();
            state.in_use -= 1;
            state.total -= 1;
            self.grant_capacity_locked(&mut state);
        }
        self.sink.record(ResourceEvent::new(Component::Pool, "detach"));
        self.spawn_replenish();
    }

    /// An unused creation permit was dropped.
    pub(crate) fn release_reservation(&self) {
        let mut state = self.state.lock();
        state.total -= 1;
        self.grant_capacity_locked(&mut state);
    }

    fn spawn_replenish(&self) {
        if self.config.min_size == 0 || !self.lifecycle.is_accepting() {
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            return;
        };
        let pool = self.weak_self.clone();
        handle.spawn(async move {
            if let Some(pool) = pool.upgrade() {
                if let Err(err) = pool.fill_to_min().await {
                    warn!(error = %err, "pool replenish failed");
                }
            }
        });
    }

    /// Open connections until the pool holds `min_size`. Returns how many
    /// were opened.
    pub(crate) async fn fill_to_min(&self) -> Result<usize> {
        let mut opened = 0;
        loop {
            let mut permit = {
                let mut state = self.state.lock();
                if !self.lifecycle.is_accepting() || state.total >= self.config.min_size {
                    break;
                }
                state.total += 1;
                CreatePermit::new(self.weak_self.clone())
            };
            match self.manager.create().await {
                Ok(raw) => {
                    permit.disarm();
                    self.return_conn(Conn::new(raw));
                    opened += 1;
                }
                Err(err) => {
                    drop(permit);
                    return Err(CoreError::connection(err));
                }
            }
        }
        if opened > 0 {
            debug!(opened, "pool replenished");
        }
        Ok(opened)
    }

    /// One maintenance pass: reap stale idle connections, validate the
    /// rest, then top up to `min_size`.
    pub(crate) async fn maintain(&self) {
        let Some(_in_flight) = self.lifecycle.track() else {
            return;
        };
        let started = Instant::now();
        let idle: Vec<_> = self.state.lock().idle.drain(..).collect();
        let mut closed = 0usize;

        for mut conn in idle {
            if self.past_lifetime(&conn) {
                self.discard(conn, "max_lifetime");
                closed += 1;
                continue;
            }
            let idle_expired = self
                .config
                .idle_timeout
                .is_some_and(|limit| conn.idle_since.elapsed() >= limit);
            if idle_expired && self.state.lock().total > self.config.min_size {
                self.discard(conn, "idle_timeout");
                closed += 1;
                continue;
            }
            match self.manager.is_valid(&mut conn.raw).await {
                // Validation is not use; the idle clock keeps running.
                Ok(true) => self.return_conn(conn),
                _ => {
                    self.discard(conn, "invalid");
                    closed += 1;
                }
            }
        }

        if let Err(err) = self.fill_to_min().await {
            warn!(error = %err, "pool maintenance could not reach min_size");
        }
        self.publish_status();
        self.sink.record(
            ResourceEvent::new(Component::Pool, "maintenance")
                .duration(started.elapsed())
                .context(format!("closed={closed}")),
        );
    }

    /// Stop the pool: fail waiters, close idle connections and wait up to
    /// `grace` for in-flight releases.
    pub(crate) async fn close(&self, grace: Duration) -> DrainResult {
        let drained = {
            let mut state = self.state.lock();
            if self.lifecycle.begin_drain() {
                let idle: Vec<_> = state.idle.drain(..).collect();
                state.total -= idle.len();
                let waiters: Vec<_> = state.waiters.drain(..).collect();
                Some((idle, waiters))
            } else {
                None
            }
        };
        let Some((idle, waiters)) = drained else {
            return self.lifecycle.wait_for_drain(grace).await;
        };

        let started = Instant::now();
        info!(idle = idle.len(), waiters = waiters.len(), "connection pool closing");
        drop(waiters);
        drop(idle);
        self.cancel.cancel();

        let result = self.lifecycle.wait_for_drain(grace).await;
        self.lifecycle.finish();
        self.publish_status();
        self.sink.record(
            ResourceEvent::new(Component::Pool, "close")
                .duration(started.elapsed())
                .success(result == DrainResult::Complete),
        );
        info!(result = ?result, "connection pool closed");
        result
    }

    fn remove_waiter(&self, id: u64) {
        let mut state = self.state.lock();
        state.waiters.retain(|w| w.id != id);
    }
}

impl<M: ConnectionManager> Drop for PoolInner<M> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Removes a waiter from the queue when its acquire finishes or is dropped.
struct WaiterGuard<'a, M: ConnectionManager> {
    pool: &'a PoolInner<M>,
    id: u64,
}

impl<M: ConnectionManager> Drop for WaiterGuard<'_, M> {
    fn drop(&mut self) {
        self.pool.remove_waiter(self.id);
    }
}

/// Background maintenance loop. Holds the pool weakly so it never keeps
/// a dropped pool alive.
pub(crate) async fn run_maintenance<M: ConnectionManager>(
    pool: Weak<PoolInner<M>>,
    cancel: CancellationToken,
    every: Duration,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        let Some(pool) = pool.upgrade() else {
            break;
        };
        pool.maintain().await;
    }
    debug!("pool maintenance exited");
}
