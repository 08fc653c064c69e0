//! # Cache Client API
//!
//! `CacheClient` owns the pool; `CacheHandle` is a cheap proxy onto the same
//! pool. Both forward commands by name, checking out one connection per
//! command.

use tracing::debug;

use dax_common::{CacheConfig, DaxError, DaxResult};
use dax_pool::{Pool, PoolStatus};

use crate::command::{Command, Dispatch};
use crate::connection::CacheManager;
use crate::resp::RespValue;
use crate::value::{CacheValue, ServerError};

/// Pooled client for a key-value/cache backend.
pub struct CacheClient {
    pool: Pool<CacheManager>,
}

impl CacheClient {
    /// Builds the pool. Only `min_idle` connections are opened up front.
    pub fn new(config: CacheConfig) -> DaxResult<Self> {
        let pool_config = config.validate()?;
        let pool = Pool::new(CacheManager::new(config), pool_config)?;
        Ok(CacheClient { pool })
    }

    /// Returns a handle bound to the shared pool.
    pub fn get_connection(&self) -> CacheHandle {
        CacheHandle {
            pool: self.pool.clone(),
        }
    }

    /// Closes idle connections. The client stays usable and reconnects on
    /// the next command.
    pub fn close(&self) {
        self.pool.close_idle();
    }

    /// Tears the pool down; later commands fail with `PoolClosed`.
    pub fn shutdown(&self) {
        self.pool.close();
    }

    pub fn status(&self) -> PoolStatus {
        self.pool.status()
    }
}

impl Dispatch for CacheClient {
    fn dispatch(&self, command: &Command) -> DaxResult<CacheValue> {
        forward(&self.pool, command)
    }
}

/// Proxy onto a client's pool. Cloning is cheap.
#[derive(Clone)]
pub struct CacheHandle {
    pool: Pool<CacheManager>,
}

impl CacheHandle {
    /// Releases this handle.
    pub fn close(self) {}
}

impl Dispatch for CacheHandle {
    fn dispatch(&self, command: &Command) -> DaxResult<CacheValue> {
        forward(&self.pool, command)
    }
}

fn forward(pool: &Pool<CacheManager>, command: &Command) -> DaxResult<CacheValue> {
    let decode = pool.manager().config().decode_responses;
    let reply = {
        let mut conn = pool.get()?;
        let reply = conn.exec(command.parts())?;
        if changes_session_state(command) {
            debug!(command = %command.name(), "retiring connection after session-state command");
            conn.mark_broken();
        }
        reply
    };
    debug!(command = %command.name(), "forwarded command");
    into_value(command, reply, decode)
}

fn into_value(command: &Command, reply: RespValue, decode: bool) -> DaxResult<CacheValue> {
    match reply {
        RespValue::Error(message) => {
            let message = String::from_utf8_lossy(&message).into_owned();
            if is_unknown_command(&message) {
                Err(DaxError::UnsupportedOperation {
                    command: command.name().into_owned(),
                    message,
                })
            } else {
                Err(DaxError::query(ServerError { message }))
            }
        }
        other => CacheValue::from_resp(other, decode),
    }
}

/// Commands whose effect stays on the connection after the call, such as a
/// different database, an open transaction or subscriber mode. Connections
/// that ran one are closed instead of going back to the pool.
fn changes_session_state(command: &Command) -> bool {
    let upper = |part: &[u8]| String::from_utf8_lossy(part).to_ascii_uppercase();
    match upper(&command.parts()[0]).as_str() {
        "SELECT" | "AUTH" | "HELLO" | "RESET" | "QUIT" | "MULTI" | "WATCH" | "SUBSCRIBE"
        | "PSUBSCRIBE" | "SSUBSCRIBE" | "MONITOR" | "READONLY" | "READWRITE" => true,
        "CLIENT" => command.parts().get(1).map_or(false, |sub| {
            matches!(
                upper(sub).as_str(),
                "SETNAME" | "SETINFO" | "REPLY" | "TRACKING" | "NO-EVICT" | "NO-TOUCH"
            )
        }),
        _ => false,
    }
}

fn is_unknown_command(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.starts_with("err unknown command") || lower.contains("unknown subcommand")
}
