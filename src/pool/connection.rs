//! Checked-out connections and creation permits.

use std::ops::{Deref, DerefMut};
use std::sync::Weak;
use std::time::{Duration, Instant};

use super::inner::PoolInner;
use super::manager::ConnectionManager;

/// A raw connection plus the bookkeeping the pool needs.
pub(crate) struct Conn<C> {
    pub(crate) raw: C,
    pub(crate) created_at: Instant,
    pub(crate) idle_since: Instant,
}

impl<C> Conn<C> {
    pub(crate) fn new(raw: C) -> Self {
        let now = Instant::now();
        Self {
            raw,
            created_at: now,
            idle_since: now,
        }
    }
}

/// What a queued waiter receives.
pub(crate) enum Handoff<M: ConnectionManager> {
    /// A validated connection, already counted as checked out.
    Connection(PooledConnection<M>),
    /// Capacity reserved for the waiter to open its own connection.
    Permit(CreatePermit<M>),
}

/// A connection checked out of a [`Pool`](super::Pool).
///
/// Dropping it returns the connection to the pool after validation. The pool
/// is referenced weakly: if it no longer exists the connection is closed
/// instead.
pub struct PooledConnection<M: ConnectionManager> {
    // Some until drop or detach.
    conn: Option<Conn<M::Connection>>,
    pool: Weak<PoolInner<M>>,
}

impl<M: ConnectionManager> PooledConnection<M> {
    pub(crate) fn new(conn: Conn<M::Connection>, pool: Weak<PoolInner<M>>) -> Self {
        Self { conn: Some(conn), pool }
    }

    /// Take the connection out without running the release path.
    pub(crate) fn into_conn(mut self) -> Option<Conn<M::Connection>> {
        self.conn.take()
    }

    /// Remove the connection from the pool's accounting and return it.
    pub fn detach(mut self) -> M::Connection {
        let conn = self.take_conn();
        if let Some(pool) = self.pool.upgrade() {
            pool.forget_checked_out();
        }
        conn.raw
    }

    /// Time since the underlying connection was opened.
    pub fn age(&self) -> Duration {
        self.conn_ref().created_at.elapsed()
    }

    fn conn_ref(&self) -> &Conn<M::Connection> {
        self.conn.as_ref().expect("connection is present until drop")
    }

    fn take_conn(&mut self) -> Conn<M::Connection> {
        self.conn.take().expect("connection is present until drop")
    }
}

impl<M: ConnectionManager> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        &self.conn_ref().raw
    }
}

impl<M: ConnectionManager> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn.as_mut().expect("connection is present until drop").raw
    }
}

impl<M: ConnectionManager> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        match self.pool.upgrade() {
            Some(pool) => pool.release(conn),
            None => drop(conn),
        }
    }
}

impl<M> std::fmt::Debug for PooledConnection<M>
where
    M: ConnectionManager,
    M::Connection: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn.as_ref().map(|c| &c.raw))
            .finish()
    }
}

/// One unit of reserved pool capacity. Released back if never fulfilled.
pub(crate) struct CreatePermit<M: ConnectionManager> {
    pool: Weak<PoolInner<M>>,
    armed: bool,
}

impl<M: ConnectionManager> CreatePermit<M> {
    /// Caller has already counted this permit in the pool's total.
    pub(crate) fn new(pool: Weak<PoolInner<M>>) -> Self {
        Self { pool, armed: true }
    }

    /// Turn the reservation into a checked-out connection.
    pub(crate) fn fulfill(mut self, raw: M::Connection) -> PooledConnection<M> {
        self.armed = false;
        let conn = Conn::new(raw);
        if let Some(pool) = self.pool.upgrade() {
            pool.mark_checked_out();
        }
        PooledConnection::new(conn, self.pool.clone())
    }

    /// Forget the reservation without touching pool state (caller holds the
    /// state lock and adjusts counts itself).
    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<M: ConnectionManager> Drop for CreatePermit<M> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(pool) = self.pool.upgrade() {
            pool.release_reservation();
        }
    }
}
