//! # RESP2 Encoding and Parsing
//!
//! Purpose: Encode forwarded commands and parse server replies without
//! external dependencies, keeping allocations under control.
//!
//! ## Design Principles
//! 1. **State-Free Parsing**: Replies are parsed top-down with minimal state.
//! 2. **Buffer Reuse**: Caller provides buffers to avoid per-call allocations.
//! 3. **Binary-Safe**: Bulk strings are treated as raw bytes.
//! 4. **Fail Fast**: Invalid framing returns protocol errors immediately.

use std::io::{BufRead, Read};

use dax_common::{DaxError, DaxResult};

/// RESP reply value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// +OK or +PONG style replies.
    Simple(Vec<u8>),
    /// -ERR ... replies.
    Error(Vec<u8>),
    /// :123 replies.
    Integer(i64),
    /// $... bulk strings.
    Bulk(Vec<u8>),
    /// $-1 and *-1.
    Nil,
    /// *... arrays.
    Array(Vec<RespValue>),
}

/// Largest bulk string or array length accepted from a server, matching the
/// server-side `proto-max-bulk-len` default.
const MAX_REPLY_LEN: i64 = 512 * 1024 * 1024;

/// Upper bound on elements pre-allocated for an array reply.
const ARRAY_PREALLOC: usize = 1024;

/// Upper bound on bytes pre-allocated for a bulk reply; the rest grows as
/// data actually arrives.
const BULK_PREALLOC: usize = 64 * 1024;

pub(crate) fn protocol_error(detail: &str) -> DaxError {
    DaxError::connection(format!("protocol error: {detail}"))
}

/// Encodes a RESP2 array command into the provided buffer.
pub fn encode_command<A: AsRef<[u8]>>(args: &[A], out: &mut Vec<u8>) {
    out.push(b'*');
    push_usize(out, args.len());
    out.extend_from_slice(b"\r\n");
    for arg in args {
        let arg = arg.as_ref();
        out.push(b'$');
        push_usize(out, arg.len());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
}

/// Reads one RESP value from the buffered reader.
pub fn read_response<R: BufRead>(reader: &mut R, line_buf: &mut Vec<u8>) -> DaxResult<RespValue> {
    read_line(reader, line_buf)?;
    if line_buf.is_empty() {
        return Err(protocol_error("empty reply line"));
    }

    match line_buf[0] {
        b'+' => Ok(RespValue::Simple(line_buf[1..].to_vec())),
        b'-' => Ok(RespValue::Error(line_buf[1..].to_vec())),
        b':' => Ok(RespValue::Integer(parse_i64(&line_buf[1..])?)),
        b'$' => {
            let len = parse_i64(&line_buf[1..])?;
            parse_bulk_len(reader, len, line_buf)
        }
        b'*' => {
            let len = parse_i64(&line_buf[1..])?;
            parse_array_len(reader, len, line_buf)
        }
        other => Err(protocol_error(&format!(
            "unexpected reply marker {:?}",
            other as char
        ))),
    }
}

fn parse_bulk_len<R: BufRead>(
    reader: &mut R,
    len: i64,
    line_buf: &mut Vec<u8>,
) -> DaxResult<RespValue> {
    if len < 0 {
        return Ok(RespValue::Nil);
    }
    if len > MAX_REPLY_LEN {
        return Err(protocol_error(&format!("bulk length {len} exceeds limit")));
    }
    let len = len as usize;
    let mut data = Vec::with_capacity(len.min(BULK_PREALLOC));
    reader.by_ref().take(len as u64).read_to_end(&mut data)?;
    if data.len() != len {
        return Err(protocol_error("bulk string truncated"));
    }

    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf)?;
    if crlf != [b'\r', b'\n'] {
        return Err(protocol_error("bulk string missing CRLF"));
    }

    line_buf.clear();
    Ok(RespValue::Bulk(data))
}

fn parse_array_len<R: BufRead>(
    reader: &mut R,
    len: i64,
    line_buf: &mut Vec<u8>,
) -> DaxResult<RespValue> {
    if len < 0 {
        return Ok(RespValue::Nil);
    }

    if len > MAX_REPLY_LEN {
        return Err(protocol_error(&format!("array length {len} exceeds limit")));
    }

    let mut items = Vec::with_capacity((len as usize).min(ARRAY_PREALLOC));
    for _ in 0..len {
        items.push(read_response(reader, line_buf)?);
    }
    Ok(RespValue::Array(items))
}

fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> DaxResult<()> {
    buf.clear();
    let bytes = reader.read_until(b'\n', buf)?;
    if bytes == 0 {
        return Err(protocol_error("connection closed by server"));
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(protocol_error("reply line missing CRLF"));
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

fn parse_i64(data: &[u8]) -> DaxResult<i64> {
    if data.is_empty() {
        return Err(protocol_error("empty integer"));
    }
    let (negative, digits) = match data[0] {
        b'-' => (true, &data[1..]),
        _ => (false, data),
    };
    if digits.is_empty() {
        return Err(protocol_error("empty integer"));
    }

    let mut value: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(protocol_error("invalid integer"));
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as i64);
    }

    Ok(if negative { -value } else { value })
}

fn push_usize(out: &mut Vec<u8>, mut value: usize) {
    // Write digits into a small stack buffer to avoid heap allocations.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        len = 1;
    } else {
        while value > 0 {
            buf[len] = b'0' + (value % 10) as u8;
            value /= 10;
            len += 1;
        }
    }
    for idx in (0..len).rev() {
        out.push(buf[idx]);
    }
}
