//! # Session and Cursor
//!
//! A `Session` is one checked-out connection plus the cursor opened on it.
//! The cursor buffers the rows of the last statement and is closed before
//! the connection goes back to the pool.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, warn};

use dax_common::{DaxError, DaxResult, Row, Value};
use dax_pool::PooledConnection;

use crate::backend::{Backend, Connection, ResultSet, SessionManager};

/// Row buffer for the most recent statement of a session.
#[derive(Debug)]
pub struct Cursor {
    columns: Arc<[String]>,
    rows: VecDeque<Vec<Value>>,
    rowcount: Option<u64>,
    closed: bool,
}

impl Cursor {
    fn new() -> Self {
        Cursor {
            columns: Arc::from(Vec::new()),
            rows: VecDeque::new(),
            rowcount: None,
            closed: false,
        }
    }

    fn load(&mut self, result: ResultSet) {
        self.columns = Arc::from(result.columns);
        self.rows = result.rows.into();
        self.rowcount = Some(result.rows_affected);
    }

    /// Column names of the last statement.
    pub fn description(&self) -> &[String] {
        &self.columns
    }

    /// Rows affected by the last statement; `None` before the first one.
    pub fn rowcount(&self) -> Option<u64> {
        self.rowcount
    }

    pub fn fetch_one(&mut self) -> Option<Row> {
        let values = self.rows.pop_front()?;
        Some(self.make_row(values))
    }

    pub fn fetch_many(&mut self, size: usize) -> Vec<Row> {
        let take = size.min(self.rows.len());
        let values: Vec<Vec<Value>> = self.rows.drain(..take).collect();
        values.into_iter().map(|v| self.make_row(v)).collect()
    }

    pub fn fetch_all(&mut self) -> Vec<Row> {
        let values: Vec<Vec<Value>> = self.rows.drain(..).collect();
        values.into_iter().map(|v| self.make_row(v)).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn close(&mut self) {
        self.rows.clear();
        self.closed = true;
    }

    fn make_row(&self, values: Vec<Value>) -> Row {
        self.columns.iter().cloned().zip(values).collect()
    }
}

/// A checked-out connection with its cursor.
///
/// Dropping the session closes the cursor, then returns the connection to
/// the pool, where any transaction still open is rolled back.
pub struct Session<B: Backend> {
    cursor: Cursor,
    conn: PooledConnection<SessionManager<B>>,
}

impl<B: Backend> Session<B> {
    pub(crate) fn new(conn: PooledConnection<SessionManager<B>>) -> Self {
        Session {
            cursor: Cursor::new(),
            conn,
        }
    }

    /// Runs a statement and loads its rows into the cursor.
    pub fn execute(&mut self, statement: &str, params: &[Value]) -> DaxResult<u64> {
        match self.conn.execute(statement, params) {
            Ok(result) => {
                let affected = result.rows_affected;
                self.cursor.load(result);
                Ok(affected)
            }
            Err(err) => {
                debug!(error = %err, "statement failed");
                if self.conn.is_broken() {
                    self.conn.mark_broken();
                }
                Err(DaxError::query(err))
            }
        }
    }

    pub fn cursor(&mut self) -> &mut Cursor {
        &mut self.cursor
    }

    pub fn fetch_one(&mut self) -> Option<Row> {
        self.cursor.fetch_one()
    }

    pub fn fetch_all(&mut self) -> Vec<Row> {
        self.cursor.fetch_all()
    }

    pub fn commit(&mut self) -> DaxResult<()> {
        self.conn.commit().map_err(|err| {
            if self.conn.is_broken() {
                self.conn.mark_broken();
            }
            DaxError::query(err)
        })
    }

    pub fn rollback(&mut self) -> DaxResult<()> {
        self.conn.rollback().map_err(|err| {
            // A connection that cannot roll back is not safe to reuse.
            self.conn.mark_broken();
            DaxError::query(err)
        })
    }

    /// Rolls back after a failed statement, keeping the statement error as
    /// the one reported to the caller.
    pub(crate) fn abort(&mut self) {
        if let Err(err) = self.rollback() {
            warn!(error = %err, "rollback failed, discarding connection");
        }
    }

    /// Closes the cursor and returns the connection to the pool.
    pub fn release(self) {}
}

impl<B: Backend> Drop for Session<B> {
    fn drop(&mut self) {
        self.cursor.close();
    }
}
