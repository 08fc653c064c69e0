//! # Connection Pool
//!
//! Generic over the backend through [`ManageConnection`]. Accounting keeps
//! `idle.len() + in_use` equal to the number of live connections, where
//! `in_use` also counts slots reserved for a connect that is in flight.

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use dax_common::{DaxError, DaxResult, PoolConfig};

/// Backend hooks used by the pool to open, check, reset and close connections.
pub trait ManageConnection: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Opens a new connection.
    fn connect(&self) -> DaxResult<Self::Connection>;

    /// Cheap liveness check run before an idle connection is handed out.
    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }

    /// Resets session state when a lease ends. `false` discards the connection.
    fn recycle(&self, _conn: &mut Self::Connection) -> bool {
        true
    }

    /// Closes a connection that is leaving the pool.
    fn disconnect(&self, conn: Self::Connection) {
        drop(conn);
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub idle: usize,
    pub in_use: usize,
    pub total: usize,
    pub closed: bool,
}

struct PoolState<C> {
    idle: VecDeque<C>,
    in_use: usize,
    closed: bool,
}

impl<C> PoolState<C> {
    #[inline]
    fn total(&self) -> usize {
        self.idle.len() + self.in_use
    }
}

struct PoolInner<M: ManageConnection> {
    manager: M,
    config: PoolConfig,
    state: Mutex<PoolState<M::Connection>>,
    available: Condvar,
}

enum Slot<C> {
    Idle(C),
    Reserved,
}

/// Connection pool handle. Clones share the same pool.
pub struct Pool<M: ManageConnection> {
    inner: Arc<PoolInner<M>>,
}

impl<M: ManageConnection> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Pool {
            inner: self.inner.clone(),
        }
    }
}

impl<M: ManageConnection> fmt::Debug for Pool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.inner.config)
            .field("status", &self.status())
            .finish()
    }
}

impl<M: ManageConnection> Pool<M> {
    /// Creates the pool and eagerly opens `config.min_idle` connections.
    pub fn new(manager: M, config: PoolConfig) -> DaxResult<Self> {
        config.validate()?;

        let mut opened = Vec::with_capacity(config.min_idle);
        for _ in 0..config.min_idle {
            match manager.connect() {
                Ok(conn) => opened.push(conn),
                Err(err) => {
                    for conn in opened {
                        manager.disconnect(conn);
                    }
                    return Err(err);
                }
            }
        }

        info!(
            min_idle = config.min_idle,
            max_size = config.max_size,
            "connection pool ready"
        );

        let state = PoolState {
            idle: opened.into_iter().collect(),
            in_use: 0,
            closed: false,
        };
        Ok(Pool {
            inner: Arc::new(PoolInner {
                manager,
                config,
                state: Mutex::new(state),
                available: Condvar::new(),
            }),
        })
    }

    /// Checks out a connection, blocking while the pool is at capacity.
    pub fn get(&self) -> DaxResult<PooledConnection<M>> {
        match self.acquire(true)? {
            Some(conn) => Ok(conn),
            None => Err(DaxError::connection("connection pool exhausted")),
        }
    }

    /// Checks out a connection without waiting. `Ok(None)` when at capacity.
    pub fn try_get(&self) -> DaxResult<Option<PooledConnection<M>>> {
        self.acquire(false)
    }

    /// Closes idle connections and rejects further checkouts. Leased
    /// connections are closed as they come back.
    pub fn close(&self) {
        let drained: Vec<M::Connection> = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            let drained = state.idle.drain(..).collect();
            self.inner.available.notify_all();
            drained
        };
        info!(closed = drained.len(), "connection pool shut down");
        for conn in drained {
            self.inner.manager.disconnect(conn);
        }
    }

    /// Closes idle connections; the pool stays open and reconnects on demand.
    pub fn close_idle(&self) {
        let drained: Vec<M::Connection> = {
            let mut state = self.inner.state.lock();
            state.idle.drain(..).collect()
        };
        debug!(closed = drained.len(), "closed idle connections");
        for conn in drained {
            self.inner.manager.disconnect(conn);
        }
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            idle: state.idle.len(),
            in_use: state.in_use,
            total: state.total(),
            closed: state.closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn manager(&self) -> &M {
        &self.inner.manager
    }

    fn acquire(&self, wait: bool) -> DaxResult<Option<PooledConnection<M>>> {
        loop {
            let slot = match self.reserve(wait)? {
                Some(slot) => slot,
                None => return Ok(None),
            };

            match slot {
                Slot::Idle(mut conn) => {
                    if self.inner.manager.has_broken(&mut conn) {
                        warn!("discarding broken idle connection");
                        self.inner.release_slot();
                        self.inner.manager.disconnect(conn);
                        continue;
                    }
                    debug!("reusing idle connection");
                    return Ok(Some(PooledConnection::new(self.inner.clone(), conn)));
                }
                Slot::Reserved => match self.inner.manager.connect() {
                    Ok(conn) => {
                        debug!("opened pooled connection");
                        return Ok(Some(PooledConnection::new(self.inner.clone(), conn)));
                    }
                    Err(err) => {
                        self.inner.release_slot();
                        return Err(err);
                    }
                },
            }
        }
    }

    fn reserve(&self, wait: bool) -> DaxResult<Option<Slot<M::Connection>>> {
        let mut state = self.inner.state.lock();
        loop {
            if state.closed {
                return Err(DaxError::PoolClosed);
            }
            if let Some(conn) = state.idle.pop_front() {
                state.in_use += 1;
                return Ok(Some(Slot::Idle(conn)));
            }
            if !self.inner.config.is_bounded() || state.total() < self.inner.config.max_size {
                state.in_use += 1;
                return Ok(Some(Slot::Reserved));
            }
            if !wait {
                return Ok(None);
            }
            debug!(
                in_use = state.in_use,
                "connection pool at capacity, waiting"
            );
            self.inner.available.wait(&mut state);
        }
    }
}

impl<M: ManageConnection> PoolInner<M> {
    fn release_slot(&self) {
        let mut state = self.state.lock();
        state.in_use = state.in_use.saturating_sub(1);
        self.available.notify_one();
    }

    fn return_connection(&self, mut conn: M::Connection, broken: bool) {
        // Reset runs I/O, so it happens before taking the lock.
        let reusable = !broken && self.manager.recycle(&mut conn);

        let discard = {
            let mut state = self.state.lock();
            state.in_use = state.in_use.saturating_sub(1);
            let has_room = self
                .config
                .max_idle
                .map_or(true, |max_idle| state.idle.len() < max_idle);
            let discard = if reusable && !state.closed && has_room {
                state.idle.push_back(conn);
                None
            } else {
                Some(conn)
            };
            self.available.notify_one();
            discard
        };

        if let Some(conn) = discard {
            if !reusable {
                warn!("discarding connection that could not be reset");
            } else {
                debug!("closing surplus connection");
            }
            self.manager.disconnect(conn);
        }
    }
}

/// RAII lease returning the connection to the pool on drop.
pub struct PooledConnection<M: ManageConnection> {
    pool: Arc<PoolInner<M>>,
    conn: Option<M::Connection>,
    broken: bool,
}

impl<M: ManageConnection> PooledConnection<M> {
    fn new(pool: Arc<PoolInner<M>>, conn: M::Connection) -> Self {
        PooledConnection {
            pool,
            conn: Some(conn),
            broken: false,
        }
    }

    /// Flags the connection so it is closed instead of parked on return.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_marked_broken(&self) -> bool {
        self.broken
    }
}

impl<M: ManageConnection> std::fmt::Debug for PooledConnection<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

impl<M: ManageConnection> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection exists")
    }
}

impl<M: ManageConnection> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection exists")
    }
}

impl<M: ManageConnection> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.return_connection(conn, self.broken);
        }
    }
}
