//! # Relational Client API
//!
//! Each call acquires a session, runs exactly one statement, and releases the
//! session before returning. Writes are committed on success and rolled back
//! on failure; reads leave their transaction to be rolled back when the
//! connection is reset on return.

use tracing::debug;

use dax_common::{DaxResult, PoolConfig, Row, Value};
use dax_pool::{Pool, PoolStatus};

use crate::backend::{Backend, SessionManager};
use crate::session::{Cursor, Session};

/// Pooled client for a relational backend.
pub struct RelationalClient<B: Backend> {
    pool: Pool<SessionManager<B>>,
}

impl<B: Backend> Clone for RelationalClient<B> {
    fn clone(&self) -> Self {
        RelationalClient {
            pool: self.pool.clone(),
        }
    }
}

#[cfg(feature = "postgres")]
impl RelationalClient<crate::pg::PgBackend> {
    /// Creates a PostgreSQL client, opening `min_pool_size` connections now.
    pub fn new(config: &dax_common::RelationalConfig) -> DaxResult<Self> {
        let pool_config = config.validate()?;
        Self::with_backend(crate::pg::PgBackend::from_config(config), pool_config)
    }
}

impl<B: Backend> RelationalClient<B> {
    /// Creates a client over any backend.
    pub fn with_backend(backend: B, config: PoolConfig) -> DaxResult<Self> {
        let pool = Pool::new(SessionManager::new(backend), config)?;
        Ok(RelationalClient { pool })
    }

    /// Checks out a connection and opens a cursor on it.
    ///
    /// Blocks while the pool is at capacity.
    pub fn acquire(&self) -> DaxResult<Session<B>> {
        let conn = self.pool.get()?;
        Ok(Session::new(conn))
    }

    /// Closes the session's cursor and returns its connection.
    ///
    /// Equivalent to dropping the session.
    pub fn release(&self, session: Session<B>) {
        session.release();
    }

    /// Returns the first matching row, or `None` when nothing matched.
    pub fn query_one(&self, statement: &str, params: &[Value]) -> DaxResult<Option<Row>> {
        self.read(statement, params, Cursor::fetch_one)
    }

    /// Returns every matching row in backend order.
    pub fn query_all(&self, statement: &str, params: &[Value]) -> DaxResult<Vec<Row>> {
        self.read(statement, params, Cursor::fetch_all)
    }

    /// Returns the first column of the first row.
    pub fn query_scalar(&self, statement: &str, params: &[Value]) -> DaxResult<Option<Value>> {
        self.read(statement, params, |cursor| {
            cursor.fetch_one().and_then(Row::into_first)
        })
    }

    /// Runs a write and commits it. Returns `true` once committed.
    pub fn execute(&self, statement: &str, params: &[Value]) -> DaxResult<bool> {
        self.write(statement, params, |_| true)
    }

    /// Runs a write that produces a row (e.g. `INSERT .. RETURNING id`) and
    /// returns that row after commit.
    pub fn execute_returning(&self, statement: &str, params: &[Value]) -> DaxResult<Option<Row>> {
        self.write(statement, params, Cursor::fetch_one)
    }

    /// Shuts the pool down, closing every connection it holds.
    pub fn close_all(&self) {
        self.pool.close();
    }

    pub fn status(&self) -> PoolStatus {
        self.pool.status()
    }

    pub fn pool_config(&self) -> &PoolConfig {
        self.pool.config()
    }

    fn read<T>(
        &self,
        statement: &str,
        params: &[Value],
        fetch: impl FnOnce(&mut Cursor) -> T,
    ) -> DaxResult<T> {
        let mut session = self.acquire()?;
        session.execute(statement, params)?;
        Ok(fetch(session.cursor()))
    }

    fn write<T>(
        &self,
        statement: &str,
        params: &[Value],
        fetch: impl FnOnce(&mut Cursor) -> T,
    ) -> DaxResult<T> {
        let mut session = self.acquire()?;
        if let Err(err) = session.execute(statement, params) {
            debug!("rolling back failed write");
            session.abort();
            return Err(err);
        }
        let out = fetch(session.cursor());
        session.commit()?;
        Ok(out)
    }
}
