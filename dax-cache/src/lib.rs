//! # dax Cache Client
//!
//! Purpose: Pooled, blocking access to a Redis-compatible cache over RESP2,
//! exposing the server's whole command set without one method per command.
//!
//! ## Design Principles
//! 1. **Capability Delegation**: `Dispatch::call`/`cmd` forward any command
//!    name; the server decides what is supported.
//! 2. **Object Pool Pattern**: TCP sessions are authenticated once and reused.
//! 3. **Borrow-Friendly API**: Arguments are anything implementing `ToArg`.
//! 4. **Fail Fast**: IO/protocol failures surface immediately and retire the
//!    connection.
//!
//! ```no_run
//! use dax_cache::{CacheClient, Dispatch};
//! use dax_common::CacheConfig;
//!
//! let client = CacheClient::new(CacheConfig::default())?;
//! client.call("SADD", &[&"tags", &"rust"])?;
//! let members = client.cmd("SMEMBERS").arg("tags").query()?;
//! # Ok::<(), dax_common::DaxError>(())
//! ```

mod client;
mod command;
mod connection;
mod resp;
mod value;

pub use client::{CacheClient, CacheHandle};
pub use command::{cmd, Call, Command, Dispatch, ToArg};
pub use connection::{CacheConnection, CacheManager};
pub use resp::RespValue;
pub use value::{CacheValue, ServerError};
