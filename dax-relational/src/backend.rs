//! # Backend Seam
//!
//! A backend opens connections; a connection runs statements inside an
//! implicit transaction that stays open until `commit` or `rollback`.

use tracing::warn;

use dax_common::{BoxError, DaxError, DaxResult, Value};
use dax_pool::ManageConnection;

/// Buffered outcome of one statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    /// Column names in backend order. Empty for statements without output.
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    /// Rows written, or rows returned for queries.
    pub rows_affected: u64,
}

/// A live session to the relational backend.
pub trait Connection: Send + 'static {
    /// Runs one statement, opening a transaction if none is active.
    fn execute(&mut self, statement: &str, params: &[Value]) -> Result<ResultSet, BoxError>;

    fn commit(&mut self) -> Result<(), BoxError>;

    fn rollback(&mut self) -> Result<(), BoxError>;

    /// Discards any open transaction before the connection is parked.
    fn reset(&mut self) -> Result<(), BoxError> {
        self.rollback()
    }

    /// True once the underlying session can no longer be used.
    fn is_broken(&mut self) -> bool {
        false
    }
}

/// Opens relational connections.
pub trait Backend: Send + Sync + 'static {
    type Connection: Connection;

    fn connect(&self) -> Result<Self::Connection, BoxError>;
}

/// Adapts a [`Backend`] to the pool's connection hooks.
pub struct SessionManager<B: Backend> {
    backend: B,
}

impl<B: Backend> SessionManager<B> {
    pub fn new(backend: B) -> Self {
        SessionManager { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}

impl<B: Backend> ManageConnection for SessionManager<B> {
    type Connection = B::Connection;

    fn connect(&self) -> DaxResult<B::Connection> {
        self.backend
            .connect()
            .map_err(|err| DaxError::connection_with("failed to connect to relational backend", err))
    }

    fn has_broken(&self, conn: &mut B::Connection) -> bool {
        conn.is_broken()
    }

    fn recycle(&self, conn: &mut B::Connection) -> bool {
        if conn.is_broken() {
            return false;
        }
        match conn.reset() {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "failed to reset relational connection");
                false
            }
        }
    }
}
