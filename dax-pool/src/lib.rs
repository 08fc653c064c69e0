//! # dax Connection Pool
//!
//! Purpose: Share a bounded set of backend connections between threads so
//! every public client call checks out one connection, uses it exclusively,
//! and hands it back.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse live connections instead of reconnecting.
//! 2. **RAII Leases**: `PooledConnection` returns itself on drop, so release
//!    happens on every exit path.
//! 3. **Blocking Acquire**: At capacity, callers park on a condition variable
//!    until a connection is returned, discarded, or the pool closes.
//! 4. **Minimal Locking**: The mutex guards only the idle list and counters;
//!    connect/reset/disconnect run outside it.

mod pool;

pub use pool::{ManageConnection, Pool, PoolStatus, PooledConnection};
