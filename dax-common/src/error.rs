//! # Error Taxonomy
//!
//! Every public operation in the workspace returns [`DaxResult`]. Absence
//! (no row, nil reply) is modelled with `Option`, never with an error, so an
//! `Err` always means something actually failed.
//!
//! ## Kinds
//!
//! | Variant | Kind | Raised when |
//! |---|---|---|
//! | `Configuration` | `Configuration` | pool sizing or connection parameters are invalid |
//! | `Connection` / `PoolClosed` | `Connection` | a connection cannot be opened or obtained |
//! | `Query` | `Query` | a statement or command failed on the backend |
//! | `UnsupportedOperation` | `UnsupportedOperation` | the backend rejected a forwarded command name |

use std::error::Error as StdError;

use thiserror::Error;

/// Boxed backend error, kept intact so callers can downcast to the driver type.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Result type used across the workspace.
pub type DaxResult<T> = Result<T, DaxError>;

/// Coarse classification of a [`DaxError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    Connection,
    Query,
    UnsupportedOperation,
}

/// Errors surfaced by the pooled clients.
#[derive(Debug, Error)]
pub enum DaxError {
    /// Invalid pool sizing or malformed connection parameters.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A connection could not be established or obtained.
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// The pool was shut down; no further connections are handed out.
    #[error("connection error: pool is closed")]
    PoolClosed,

    /// Statement execution failed. `source` is the backend error, unchanged.
    #[error("query error: {source}")]
    Query {
        #[source]
        source: BoxError,
    },

    /// The backend rejected a forwarded command.
    #[error("unsupported operation `{command}`: {message}")]
    UnsupportedOperation { command: String, message: String },
}

impl DaxError {
    pub fn configuration(message: impl Into<String>) -> Self {
        DaxError::Configuration(message.into())
    }

    /// Connection failure without an underlying cause.
    pub fn connection(message: impl Into<String>) -> Self {
        DaxError::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Connection failure wrapping the driver error that caused it.
    pub fn connection_with<E>(message: impl Into<String>, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        DaxError::Connection {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn query<E>(source: E) -> Self
    where
        E: Into<BoxError>,
    {
        DaxError::Query {
            source: source.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DaxError::Configuration(_) => ErrorKind::Configuration,
            DaxError::Connection { .. } | DaxError::PoolClosed => ErrorKind::Connection,
            DaxError::Query { .. } => ErrorKind::Query,
            DaxError::UnsupportedOperation { .. } => ErrorKind::UnsupportedOperation,
        }
    }

    /// Returns the backend error carried by `Query`/`Connection`, if any.
    pub fn backend_error(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        match self {
            DaxError::Query { source } => Some(source.as_ref()),
            DaxError::Connection {
                source: Some(source),
                ..
            } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for DaxError {
    fn from(err: std::io::Error) -> Self {
        DaxError::connection_with("io failure", err)
    }
}
