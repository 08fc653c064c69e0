//! # dax
//!
//! Purpose: One explicitly constructed context holding the relational and
//! cache clients for a process. Callers pass it (or clones of its clients)
//! to the code that needs data access; there is no global state.
//!
//! ```no_run
//! use dax::{DataAccess, DataAccessConfig, Dispatch};
//!
//! let context = DataAccess::init(&DataAccessConfig::default())?;
//! let row = context
//!     .relational()
//!     .execute_returning("insert into users(name) values(%s) returning id", &dax::params!["ada"])?;
//! context.cache().call("SET", &[&"last_user", &"ada"])?;
//! context.shutdown();
//! # Ok::<(), dax::DaxError>(())
//! ```

use serde::Deserialize;
use tracing::info;

pub use dax_cache::{
    cmd, Call, CacheClient, CacheHandle, CacheValue, Command, Dispatch, ServerError, ToArg,
};
pub use dax_common::{
    params, BoxError, CacheConfig, DaxError, DaxResult, ErrorKind, PoolConfig, RelationalConfig,
    Row, Value,
};
pub use dax_pool::PoolStatus;
pub use dax_relational::{Backend, Connection, Cursor, RelationalClient, ResultSet, Session};

#[cfg(feature = "postgres")]
pub use dax_relational::{PgBackend, PgConnection};

/// Settings for both clients, typically loaded from a file by the caller.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DataAccessConfig {
    pub relational: RelationalConfig,
    pub cache: CacheConfig,
}

/// Process-wide data access context.
pub struct DataAccess<B: Backend> {
    relational: RelationalClient<B>,
    cache: CacheClient,
}

#[cfg(feature = "postgres")]
impl DataAccess<PgBackend> {
    /// Builds both pools from configuration. Each pool opens its minimum
    /// number of connections before this returns.
    pub fn init(config: &DataAccessConfig) -> DaxResult<Self> {
        let relational = RelationalClient::new(&config.relational)?;
        let cache = match CacheClient::new(config.cache.clone()) {
            Ok(cache) => cache,
            Err(err) => {
                relational.close_all();
                return Err(err);
            }
        };
        info!(
            relational = %format!("{}:{}", config.relational.host, config.relational.port),
            cache = %config.cache.addr(),
            "data access initialised"
        );
        Ok(DataAccess { relational, cache })
    }
}

impl<B: Backend> DataAccess<B> {
    /// Wraps clients built elsewhere, e.g. over a custom backend.
    pub fn from_parts(relational: RelationalClient<B>, cache: CacheClient) -> Self {
        DataAccess { relational, cache }
    }

    pub fn relational(&self) -> &RelationalClient<B> {
        &self.relational
    }

    pub fn cache(&self) -> &CacheClient {
        &self.cache
    }

    /// Closes both pools. Clones of the relational client observe the
    /// closed pool and fail with `PoolClosed`.
    pub fn shutdown(self) {
        self.relational.close_all();
        self.cache.shutdown();
        info!("data access shut down");
    }
}
