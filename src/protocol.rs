//! RESP2 protocol implementation
//!
//! Inline multibulk encoding of command frames and incremental decoding of
//! server replies. The decoder is resumable: it returns `None` when the
//! buffer does not yet hold a complete frame.

use crate::core::error::{RedisError, RedisResult};
use crate::core::value::RespValue;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::Cursor;

const CRLF: &[u8] = b"\r\n";

/// Encodes commands and values into RESP2 wire form
pub struct RespEncoder;

impl RespEncoder {
    /// Encode a command as a multibulk array of its argument frames
    #[must_use]
    pub fn encode_parts(parts: &[Bytes]) -> Bytes {
        let mut buf = BytesMut::with_capacity(parts.iter().map(|p| p.len() + 16).sum());

        buf.put_u8(b'*');
        buf.put_slice(parts.len().to_string().as_bytes());
        buf.put_slice(CRLF);

        for part in parts {
            buf.put_u8(b'$');
            buf.put_slice(part.len().to_string().as_bytes());
            buf.put_slice(CRLF);
            buf.put_slice(part);
            buf.put_slice(CRLF);
        }

        buf.freeze()
    }

    /// Encode a single RESP value
    pub fn encode(value: &RespValue, buf: &mut BytesMut) {
        match value {
            RespValue::SimpleString(s) => {
                buf.put_u8(b'+');
                buf.put_slice(s.as_bytes());
                buf.put_slice(CRLF);
            }
            RespValue::Error(e) => {
                buf.put_u8(b'-');
                buf.put_slice(e.as_bytes());
                buf.put_slice(CRLF);
            }
            RespValue::Integer(i) => {
                buf.put_u8(b':');
                buf.put_slice(i.to_string().as_bytes());
                buf.put_slice(CRLF);
            }
            RespValue::BulkString(data) => {
                buf.put_u8(b'$');
                buf.put_slice(data.len().to_string().as_bytes());
                buf.put_slice(CRLF);
                buf.put_slice(data);
                buf.put_slice(CRLF);
            }
            RespValue::Null => {
                buf.put_slice(b"$-1\r\n");
            }
            RespValue::Array(arr) => {
                buf.put_u8(b'*');
                buf.put_slice(arr.len().to_string().as_bytes());
                buf.put_slice(CRLF);
                for item in arr {
                    Self::encode(item, buf);
                }
            }
        }
    }
}

/// Decodes RESP2 values from a byte buffer
pub struct RespDecoder;

impl RespDecoder {
    /// Decode one value from the buffer, or `None` if the frame is incomplete
    pub fn decode(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<RespValue>> {
        if !buf.has_remaining() {
            return Ok(None);
        }

        match buf.chunk()[0] {
            b'+' => Self::decode_line(buf, |s| Ok(RespValue::SimpleString(s))),
            b'-' => Self::decode_line(buf, |s| Ok(RespValue::Error(s))),
            b':' => Self::decode_line(buf, |s| {
                let num = s
                    .parse::<i64>()
                    .map_err(|e| RedisError::Protocol(format!("Invalid integer: {e}")))?;
                Ok(RespValue::Integer(num))
            }),
            b'$' => Self::decode_bulk_string(buf),
            b'*' => Self::decode_array(buf),
            other => Err(RedisError::Protocol(format!(
                "Invalid RESP type byte: {}",
                other as char
            ))),
        }
    }

    fn decode_line<F>(buf: &mut Cursor<&[u8]>, convert: F) -> RedisResult<Option<RespValue>>
    where
        F: FnOnce(String) -> RedisResult<RespValue>,
    {
        buf.advance(1);

        let Some(line) = Self::read_line(buf) else {
            return Ok(None);
        };

        let text = String::from_utf8(line)
            .map_err(|e| RedisError::Protocol(format!("Invalid UTF-8: {e}")))?;

        convert(text).map(Some)
    }

    fn decode_bulk_string(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<RespValue>> {
        buf.advance(1);

        let Some(len) = Self::read_length(buf)? else {
            return Ok(None);
        };

        if len < 0 {
            return Ok(Some(RespValue::Null));
        }

        let len = len as usize;
        if buf.remaining() < len + 2 {
            return Ok(None);
        }

        let data = Bytes::copy_from_slice(&buf.chunk()[..len]);
        buf.advance(len + 2);

        Ok(Some(RespValue::BulkString(data)))
    }

    fn decode_array(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<RespValue>> {
        buf.advance(1);

        let Some(len) = Self::read_length(buf)? else {
            return Ok(None);
        };

        if len < 0 {
            return Ok(Some(RespValue::Null));
        }

        let mut items = Vec::with_capacity(len as usize);
        for _ in 0..len {
            match Self::decode(buf)? {
                Some(value) => items.push(value),
                None => return Ok(None),
            }
        }

        Ok(Some(RespValue::Array(items)))
    }

    fn read_length(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<i64>> {
        let Some(line) = Self::read_line(buf) else {
            return Ok(None);
        };

        let text = std::str::from_utf8(&line)
            .map_err(|e| RedisError::Protocol(format!("Invalid UTF-8: {e}")))?;

        text.parse::<i64>()
            .map(Some)
            .map_err(|e| RedisError::Protocol(format!("Invalid length prefix: {e}")))
    }

    fn read_line(buf: &mut Cursor<&[u8]>) -> Option<Vec<u8>> {
        let start = buf.position() as usize;
        let slice = buf.get_ref();

        for i in start..slice.len().saturating_sub(1) {
            if slice[i] == b'\r' && slice[i + 1] == b'\n' {
                let line = slice[start..i].to_vec();
                buf.set_position((i + 2) as u64);
                return Some(line);
            }
        }

        None
    }
}
