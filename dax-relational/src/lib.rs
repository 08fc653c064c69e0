//! # dax Relational Client
//!
//! Purpose: Run SQL statements against a pooled relational backend with one
//! transaction per public call.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `RelationalClient` hides pooling, cursors and
//!    transaction boundaries behind `query_*`/`execute*` calls.
//! 2. **Scoped Acquisition**: `Session` owns the pooled connection and its
//!    cursor; dropping it closes the cursor and returns the connection.
//! 3. **Rollback Is Terminal**: a failed statement is rolled back and its
//!    error returned as-is; commit is never attempted afterwards.
//! 4. **Strategy Pattern**: `Backend`/`Connection` traits keep the client
//!    independent of the driver; PostgreSQL ships behind the `postgres`
//!    feature.

mod backend;
mod client;
mod session;

#[cfg(feature = "postgres")]
pub mod pg;

pub use backend::{Backend, Connection, ResultSet, SessionManager};
pub use client::RelationalClient;
pub use session::{Cursor, Session};

#[cfg(feature = "postgres")]
pub use pg::{PgBackend, PgConnection};

pub use dax_common::{params, BoxError, DaxError, DaxResult, ErrorKind, PoolConfig, RelationalConfig, Row, Value};
pub use dax_pool::PoolStatus;
