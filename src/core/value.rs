//! RESP (`REdis` Serialization Protocol) value types

use crate::core::error::{RedisError, RedisResult};
use bytes::Bytes;

/// RESP protocol value
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RespValue {
    /// Simple string: +OK\r\n
    SimpleString(String),
    /// Error: -ERR message\r\n
    Error(String),
    /// Integer: :1000\r\n
    Integer(i64),
    /// Bulk string: $6\r\nfoobar\r\n
    BulkString(Bytes),
    /// Null bulk string: $-1\r\n
    #[default]
    Null,
    /// Array: *2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n
    Array(Vec<RespValue>),
}

impl RespValue {
    /// Convert to an owned string if possible
    pub fn as_string(&self) -> RedisResult<String> {
        match self {
            Self::SimpleString(s) => Ok(s.clone()),
            Self::BulkString(b) => String::from_utf8(b.to_vec())
                .map_err(|e| RedisError::Protocol(format!("Invalid UTF-8: {e}"))),
            Self::Integer(i) => Ok(i.to_string()),
            _ => Err(RedisError::Protocol(format!(
                "Cannot convert {self:?} to string"
            ))),
        }
    }

    /// Convert to a signed integer if possible
    pub fn as_int(&self) -> RedisResult<i64> {
        match self {
            Self::Integer(i) => Ok(*i),
            Self::SimpleString(s) => s
                .parse::<i64>()
                .map_err(|e| RedisError::Protocol(format!("Cannot parse integer: {e}"))),
            Self::BulkString(b) => {
                let s = std::str::from_utf8(b)
                    .map_err(|e| RedisError::Protocol(format!("Invalid UTF-8: {e}")))?;
                s.parse::<i64>()
                    .map_err(|e| RedisError::Protocol(format!("Cannot parse integer: {e}")))
            }
            _ => Err(RedisError::Protocol(format!(
                "Cannot convert {self:?} to integer"
            ))),
        }
    }

    /// Parse as an unsigned cursor value (SCAN replies carry cursors as bulk
    /// strings)
    pub fn as_u64(&self) -> RedisResult<u64> {
        match self {
            Self::Integer(i) if *i >= 0 => Ok(*i as u64),
            Self::SimpleString(s) => s
                .parse::<u64>()
                .map_err(|e| RedisError::Protocol(format!("Cannot parse cursor: {e}"))),
            Self::BulkString(b) => {
                let s = std::str::from_utf8(b)
                    .map_err(|e| RedisError::Protocol(format!("Invalid UTF-8: {e}")))?;
                s.parse::<u64>()
                    .map_err(|e| RedisError::Protocol(format!("Cannot parse cursor: {e}")))
            }
            _ => Err(RedisError::Protocol(format!(
                "Cannot convert {self:?} to cursor"
            ))),
        }
    }

    /// Convert to raw bytes if possible
    pub fn as_bytes(&self) -> RedisResult<Bytes> {
        match self {
            Self::BulkString(b) => Ok(b.clone()),
            Self::SimpleString(s) => Ok(Bytes::copy_from_slice(s.as_bytes())),
            Self::Null => Err(RedisError::Protocol("Value is null".to_string())),
            _ => Err(RedisError::Protocol(format!(
                "Cannot convert {self:?} to bytes"
            ))),
        }
    }

    /// Borrow the array elements if this is an array
    #[must_use]
    pub fn array(&self) -> Option<&[RespValue]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Check if this is a null value
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Check if this is an error
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Error message text, when this is an error
    #[must_use]
    pub fn error_text(&self) -> Option<&str> {
        match self {
            Self::Error(msg) => Some(msg),
            _ => None,
        }
    }
}

impl From<String> for RespValue {
    fn from(s: String) -> Self {
        Self::BulkString(Bytes::from(s.into_bytes()))
    }
}
impl From<&str> for RespValue {
    fn from(s: &str) -> Self {
        Self::BulkString(Bytes::copy_from_slice(s.as_bytes()))
    }
}
impl From<i64> for RespValue {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}
impl From<Vec<u8>> for RespValue {
    fn from(b: Vec<u8>) -> Self {
        Self::BulkString(Bytes::from(b))
    }
}
impl From<Bytes> for RespValue {
    fn from(b: Bytes) -> Self {
        Self::BulkString(b)
    }
}
