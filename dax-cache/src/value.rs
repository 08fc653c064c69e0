//! # Reply Values
//!
//! Replies are returned as the server sent them; the only transformation is
//! optional UTF-8 decoding of bulk strings when `decode_responses` is set.

use thiserror::Error;

use dax_common::{DaxError, DaxResult};

use crate::resp::RespValue;

/// Error reply sent by the cache server.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ServerError {
    pub message: String,
}

impl ServerError {
    /// Leading error code, e.g. `WRONGTYPE` or `ERR`.
    pub fn code(&self) -> &str {
        self.message.split_whitespace().next().unwrap_or_default()
    }
}

/// A reply from a forwarded command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheValue {
    Nil,
    Int(i64),
    /// Status reply such as `OK` or `PONG`.
    Status(String),
    /// Bulk string, decoded.
    Text(String),
    /// Bulk string, raw.
    Data(Vec<u8>),
    Array(Vec<CacheValue>),
    /// Error nested inside an array reply (e.g. inside `EXEC` results).
    Error(String),
}

impl CacheValue {
    pub(crate) fn from_resp(resp: RespValue, decode: bool) -> DaxResult<Self> {
        Ok(match resp {
            RespValue::Simple(text) => CacheValue::Status(String::from_utf8_lossy(&text).into_owned()),
            RespValue::Error(text) => CacheValue::Error(String::from_utf8_lossy(&text).into_owned()),
            RespValue::Integer(value) => CacheValue::Int(value),
            RespValue::Nil => CacheValue::Nil,
            RespValue::Bulk(data) if decode => {
                CacheValue::Text(String::from_utf8(data).map_err(DaxError::query)?)
            }
            RespValue::Bulk(data) => CacheValue::Data(data),
            RespValue::Array(items) => CacheValue::Array(
                items
                    .into_iter()
                    .map(|item| CacheValue::from_resp(item, decode))
                    .collect::<DaxResult<Vec<_>>>()?,
            ),
        })
    }

    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, CacheValue::Nil)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            CacheValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// Text of a status or decoded bulk reply.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            CacheValue::Status(text) | CacheValue::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            CacheValue::Data(data) => Some(data),
            CacheValue::Text(text) | CacheValue::Status(text) => Some(text.as_bytes()),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[CacheValue]> {
        match self {
            CacheValue::Array(items) => Some(items),
            _ => None,
        }
    }

    /// True for the `OK` status reply.
    pub fn is_ok(&self) -> bool {
        matches!(self, CacheValue::Status(text) if text == "OK")
    }
}
