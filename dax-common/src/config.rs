//! # Configuration Records
//!
//! Plain records produced by whatever loads configuration for the process.
//! Nothing here reads files or the environment; records only deserialize and
//! validate themselves into pool sizing.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{DaxError, DaxResult};

/// Sizing for a connection pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Connections opened at construction and kept idle as a floor.
    pub min_idle: usize,
    /// Maximum total connections (idle + in-use). 0 means unbounded.
    pub max_size: usize,
    /// Maximum idle connections parked in the pool. `None` keeps every
    /// returned connection.
    pub max_idle: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            min_idle: 0,
            max_size: 0,
            max_idle: None,
        }
    }
}

impl PoolConfig {
    /// Builds a config from signed sizes as supplied by a config source.
    pub fn from_sizes(min: i64, max: i64) -> DaxResult<Self> {
        if min < 0 {
            return Err(DaxError::configuration(format!(
                "minimum pool size must not be negative (got {min})"
            )));
        }
        if max < 0 {
            return Err(DaxError::configuration(format!(
                "maximum pool size must not be negative (got {max})"
            )));
        }
        let config = PoolConfig {
            min_idle: min as usize,
            max_size: max as usize,
            max_idle: None,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> DaxResult<()> {
        if self.max_size > 0 && self.min_idle > self.max_size {
            return Err(DaxError::configuration(format!(
                "minimum pool size {} exceeds maximum {}",
                self.min_idle, self.max_size
            )));
        }
        if let Some(max_idle) = self.max_idle {
            if max_idle < self.min_idle {
                return Err(DaxError::configuration(format!(
                    "max idle {} is below minimum pool size {}",
                    max_idle, self.min_idle
                )));
            }
        }
        Ok(())
    }

    /// True when `max_size` limits concurrent checkouts.
    #[inline]
    pub fn is_bounded(&self) -> bool {
        self.max_size > 0
    }
}

/// Connection parameters for the relational backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelationalConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    /// Signed so that a negative value from the config source is reported as
    /// a configuration error rather than a parse failure.
    pub min_pool_size: i64,
    /// 0 means unbounded.
    pub max_pool_size: i64,
    /// Idle connections kept after a call returns. `None` parks every
    /// returned connection; `Some(min_pool_size)` closes returns beyond the
    /// minimum, so the pool shrinks back to its floor between bursts.
    pub max_idle: Option<usize>,
    pub connect_timeout_secs: Option<u64>,
}

impl Default for RelationalConfig {
    fn default() -> Self {
        RelationalConfig {
            host: "127.0.0.1".to_string(),
            port: 5432,
            database: "postgres".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            min_pool_size: 0,
            max_pool_size: 0,
            max_idle: None,
            connect_timeout_secs: None,
        }
    }
}

impl RelationalConfig {
    /// Checks connection parameters and returns the pool sizing.
    pub fn validate(&self) -> DaxResult<PoolConfig> {
        require_non_empty("host", &self.host)?;
        require_non_empty("database", &self.database)?;
        require_non_empty("user", &self.user)?;
        require_port(self.port)?;

        let mut pool = PoolConfig::from_sizes(self.min_pool_size, self.max_pool_size)?;
        pool.max_idle = self.max_idle;
        pool.validate()?;
        Ok(pool)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_secs.map(Duration::from_secs)
    }
}

/// Connection parameters for the key-value/cache backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub host: String,
    pub port: u16,
    /// Logical database (namespace) selected on every new connection.
    pub db: u32,
    pub password: Option<String>,
    /// Return string replies as text instead of raw bytes.
    pub decode_responses: bool,
    /// 0 means unbounded.
    pub max_connections: usize,
    pub min_idle: usize,
    pub connect_timeout_secs: Option<u64>,
    pub read_timeout_secs: Option<u64>,
    pub write_timeout_secs: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            host: "127.0.0.1".to_string(),
            port: 6379,
            db: 0,
            password: None,
            decode_responses: true,
            max_connections: 0,
            min_idle: 0,
            connect_timeout_secs: None,
            read_timeout_secs: None,
            write_timeout_secs: None,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> DaxResult<PoolConfig> {
        require_non_empty("host", &self.host)?;
        require_port(self.port)?;

        let pool = PoolConfig {
            min_idle: self.min_idle,
            max_size: self.max_connections,
            max_idle: None,
        };
        pool.validate()?;
        Ok(pool)
    }

    /// `host:port` as used for the TCP connect.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_secs.map(Duration::from_secs)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_secs.map(Duration::from_secs)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout_secs.map(Duration::from_secs)
    }
}

fn require_non_empty(field: &str, value: &str) -> DaxResult<()> {
    if value.trim().is_empty() {
        return Err(DaxError::configuration(format!("{field} must not be empty")));
    }
    Ok(())
}

fn require_port(port: u16) -> DaxResult<()> {
    if port == 0 {
        return Err(DaxError::configuration("port must not be 0"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn negative_pool_sizes_are_rejected() {
        let config = RelationalConfig {
            min_pool_size: -1,
            ..RelationalConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let config = RelationalConfig {
            max_pool_size: -3,
            ..RelationalConfig::default()
        };
        assert_eq!(config.validate().unwrap_err().kind(), ErrorKind::Configuration);
    }

    #[test]
    fn min_above_bounded_max_is_rejected() {
        assert!(PoolConfig::from_sizes(4, 2).is_err());
        // Unbounded maximum accepts any minimum.
        let pool = PoolConfig::from_sizes(4, 0).expect("unbounded");
        assert!(!pool.is_bounded());
    }

    #[test]
    fn idle_cap_carries_into_pool_sizing() {
        let config = RelationalConfig {
            min_pool_size: 2,
            max_pool_size: 10,
            max_idle: Some(2),
            ..RelationalConfig::default()
        };
        let pool = config.validate().expect("sizing");
        assert_eq!(pool.max_idle, Some(2));
        assert_eq!(pool.min_idle, 2);
        assert_eq!(RelationalConfig::default().validate().expect("defaults").max_idle, None);
    }

    #[test]
    fn relational_defaults_validate() {
        let pool = RelationalConfig::default().validate().expect("defaults");
        assert_eq!(pool, PoolConfig::default());
    }

    #[test]
    fn empty_host_is_a_configuration_error() {
        let config = CacheConfig {
            host: " ".to_string(),
            ..CacheConfig::default()
        };
        assert_eq!(config.validate().unwrap_err().kind(), ErrorKind::Configuration);
    }

    #[test]
    fn port_zero_is_rejected() {
        let config = RelationalConfig {
            port: 0,
            ..RelationalConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn max_idle_below_min_is_rejected() {
        let config = RelationalConfig {
            min_pool_size: 3,
            max_pool_size: 5,
            max_idle: Some(1),
            ..RelationalConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn cache_config_addr() {
        let config = CacheConfig {
            host: "cache.local".to_string(),
            port: 6380,
            ..CacheConfig::default()
        };
        assert_eq!(config.addr(), "cache.local:6380");
        assert!(config.decode_responses);
    }
}
