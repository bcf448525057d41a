//! RESP2 protocol encoder and decoder.
//!
//! Commands are encoded as multi-bulk arrays
//! (`*<n>\r\n$<len>\r\n<bytes>\r\n` per argument); replies are decoded
//! streaming from a [`BytesMut`] fill buffer. An error reply (`-ERR …`) is a
//! reply *value* ([`Reply::Error`]), not a transport fault: the migration hot
//! path classifies it and moves on.

use std::io::Cursor;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// A decoded RESP reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Simple string: `+OK\r\n`
    Simple(Bytes),
    /// Error: `-ERR message\r\n` — a non-fatal reply class.
    Error(Bytes),
    /// Integer: `:1000\r\n`
    Integer(i64),
    /// Bulk string: `$5\r\nhello\r\n`, or `$-1\r\n` for null.
    Bulk(Option<Bytes>),
    /// Array: `*2\r\n…`, or `*-1\r\n` for null.
    Array(Option<Vec<Reply>>),
}

impl Reply {
    /// Returns `true` if this is an error reply.
    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// Returns `true` for the `+OK` status reply.
    pub fn is_ok(&self) -> bool {
        matches!(self, Reply::Simple(s) if s.as_ref() == b"OK")
    }

    /// The error text, if this is an error reply with valid UTF-8.
    pub fn error_text(&self) -> Option<&str> {
        match self {
            Reply::Error(msg) => std::str::from_utf8(msg).ok(),
            _ => None,
        }
    }

    /// The payload of a simple or bulk string reply.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Reply::Simple(s) => Some(s),
            Reply::Bulk(Some(b)) => Some(b),
            _ => None,
        }
    }
}

/// One outbound command argument.
///
/// Large DUMP payloads arrive from the snapshot reader as buffer chains;
/// [`Arg::Chunked`] writes such a chain under a single bulk-string header
/// without gluing the chunks together first.
#[derive(Debug, Clone)]
pub enum Arg {
    /// A single contiguous buffer.
    Plain(Bytes),
    /// A chain of buffers forming one logical argument.
    Chunked(Vec<Bytes>),
}

impl Arg {
    /// Total byte length of the argument.
    pub fn len(&self) -> usize {
        match self {
            Arg::Plain(b) => b.len(),
            Arg::Chunked(chunks) => chunks.iter().map(Bytes::len).sum(),
        }
    }

    /// Returns `true` if the argument is zero bytes long.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Bytes> for Arg {
    fn from(b: Bytes) -> Self {
        Arg::Plain(b)
    }
}

impl From<&'static str> for Arg {
    fn from(s: &'static str) -> Self {
        Arg::Plain(Bytes::from_static(s.as_bytes()))
    }
}

/// Encode a command given as eager byte slices.
pub fn encode_command(args: &[Bytes], buf: &mut BytesMut) {
    buf.put_u8(b'*');
    buf.put_slice(args.len().to_string().as_bytes());
    buf.put_slice(b"\r\n");

    for arg in args {
        buf.put_u8(b'$');
        buf.put_slice(arg.len().to_string().as_bytes());
        buf.put_slice(b"\r\n");
        buf.put_slice(arg);
        buf.put_slice(b"\r\n");
    }
}

/// Encode a command whose arguments may be buffer chains.
pub fn encode_argv(args: &[Arg], buf: &mut BytesMut) {
    buf.put_u8(b'*');
    buf.put_slice(args.len().to_string().as_bytes());
    buf.put_slice(b"\r\n");

    for arg in args {
        buf.put_u8(b'$');
        buf.put_slice(arg.len().to_string().as_bytes());
        buf.put_slice(b"\r\n");
        match arg {
            Arg::Plain(b) => buf.put_slice(b),
            Arg::Chunked(chunks) => {
                for chunk in chunks {
                    buf.put_slice(chunk);
                }
            }
        }
        buf.put_slice(b"\r\n");
    }
}

/// Attempt to decode one reply from the buffer.
///
/// Returns `Ok(Some(reply))` if a complete frame was parsed (and consumed),
/// `Ok(None)` if more data is needed, or `Err` if the bytes are malformed.
/// A partial frame is never consumed.
pub fn decode_reply(buf: &mut BytesMut) -> Result<Option<Reply>> {
    if buf.is_empty() {
        return Ok(None);
    }

    let mut cursor = Cursor::new(&buf[..]);
    match check_complete(&mut cursor)? {
        None => Ok(None),
        Some(len) => {
            cursor.set_position(0);
            let reply = parse_reply(&mut cursor)?;
            buf.advance(len);
            Ok(Some(reply))
        }
    }
}

/// Check whether a complete frame is available, returning its byte length,
/// or `None` when the buffer ends mid-frame.
fn check_complete(cursor: &mut Cursor<&[u8]>) -> Result<Option<usize>> {
    let Some(kind) = peek_byte(cursor) else {
        return Ok(None);
    };
    match kind {
        b'+' | b'-' | b':' => {
            if !skip_line(cursor) {
                return Ok(None);
            }
            Ok(Some(cursor.position() as usize))
        }
        b'$' => {
            cursor.advance(1);
            let Some(len) = read_decimal(cursor)? else {
                return Ok(None);
            };
            if len == -1 {
                return Ok(Some(cursor.position() as usize));
            }
            if len < -1 {
                return Err(Error::Protocol("negative bulk string length".into()));
            }
            let total = cursor.position() as usize + len as usize + 2;
            if cursor.get_ref().len() < total {
                return Ok(None);
            }
            cursor.set_position(total as u64);
            Ok(Some(total))
        }
        b'*' => {
            cursor.advance(1);
            let Some(count) = read_decimal(cursor)? else {
                return Ok(None);
            };
            if count == -1 {
                return Ok(Some(cursor.position() as usize));
            }
            if count < -1 {
                return Err(Error::Protocol("negative array length".into()));
            }
            for _ in 0..count {
                if check_complete(cursor)?.is_none() {
                    return Ok(None);
                }
            }
            Ok(Some(cursor.position() as usize))
        }
        byte => Err(Error::Protocol(format!("unexpected byte: 0x{:02x}", byte))),
    }
}

/// Parse a reply from the cursor. The frame is known to be complete.
fn parse_reply(cursor: &mut Cursor<&[u8]>) -> Result<Reply> {
    match get_byte(cursor)? {
        b'+' => {
            let line = read_line(cursor)?;
            Ok(Reply::Simple(Bytes::copy_from_slice(line)))
        }
        b'-' => {
            let line = read_line(cursor)?;
            Ok(Reply::Error(Bytes::copy_from_slice(line)))
        }
        b':' => {
            let line = read_line(cursor)?;
            let s = std::str::from_utf8(line)
                .map_err(|_| Error::Protocol("invalid UTF-8 in integer".into()))?;
            let n = s
                .parse::<i64>()
                .map_err(|_| Error::Protocol(format!("invalid integer: {}", s)))?;
            Ok(Reply::Integer(n))
        }
        b'$' => {
            let line = read_line(cursor)?;
            let len = parse_len(line)?;
            if len == -1 {
                return Ok(Reply::Bulk(None));
            }
            let data = read_bytes(cursor, len as usize)?;
            let bulk = Bytes::copy_from_slice(data);
            skip_crlf(cursor)?;
            Ok(Reply::Bulk(Some(bulk)))
        }
        b'*' => {
            let line = read_line(cursor)?;
            let count = parse_len(line)?;
            if count == -1 {
                return Ok(Reply::Array(None));
            }
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                items.push(parse_reply(cursor)?);
            }
            Ok(Reply::Array(Some(items)))
        }
        byte => Err(Error::Protocol(format!("unexpected byte: 0x{:02x}", byte))),
    }
}

// ── Low-level cursor helpers ────────────────────────────────────────────────

fn peek_byte(cursor: &Cursor<&[u8]>) -> Option<u8> {
    let pos = cursor.position() as usize;
    cursor.get_ref().get(pos).copied()
}

fn get_byte(cursor: &mut Cursor<&[u8]>) -> Result<u8> {
    let byte = peek_byte(cursor).ok_or(Error::ConnectionClosed)?;
    cursor.advance(1);
    Ok(byte)
}

/// Advance past the next CRLF; returns `false` if the line is incomplete.
fn skip_line(cursor: &mut Cursor<&[u8]>) -> bool {
    let start = cursor.position() as usize;
    let buf = cursor.get_ref();
    for i in start..buf.len().saturating_sub(1) {
        if buf[i] == b'\r' && buf[i + 1] == b'\n' {
            cursor.set_position((i + 2) as u64);
            return true;
        }
    }
    false
}

fn read_line<'a>(cursor: &mut Cursor<&'a [u8]>) -> Result<&'a [u8]> {
    let start = cursor.position() as usize;
    let buf: &'a [u8] = *cursor.get_ref();
    for i in start..buf.len().saturating_sub(1) {
        if buf[i] == b'\r' && buf[i + 1] == b'\n' {
            cursor.set_position((i + 2) as u64);
            return Ok(&buf[start..i]);
        }
    }
    Err(Error::Protocol("missing CRLF".into()))
}

/// Read a CRLF-terminated decimal; `None` when the line is incomplete.
fn read_decimal(cursor: &mut Cursor<&[u8]>) -> Result<Option<i64>> {
    let start = cursor.position() as usize;
    let buf: &[u8] = *cursor.get_ref();
    for i in start..buf.len().saturating_sub(1) {
        if buf[i] == b'\r' && buf[i + 1] == b'\n' {
            cursor.set_position((i + 2) as u64);
            return parse_len(&buf[start..i]).map(Some);
        }
    }
    Ok(None)
}

fn parse_len(line: &[u8]) -> Result<i64> {
    let s = std::str::from_utf8(line)
        .map_err(|_| Error::Protocol("invalid UTF-8 in length".into()))?;
    s.parse::<i64>()
        .map_err(|_| Error::Protocol(format!("invalid length: {}", s)))
}

fn read_bytes<'a>(cursor: &mut Cursor<&'a [u8]>, n: usize) -> Result<&'a [u8]> {
    let start = cursor.position() as usize;
    let buf: &'a [u8] = *cursor.get_ref();
    if start + n > buf.len() {
        return Err(Error::Protocol("truncated bulk string".into()));
    }
    cursor.set_position((start + n) as u64);
    Ok(&buf[start..start + n])
}

fn skip_crlf(cursor: &mut Cursor<&[u8]>) -> Result<()> {
    let pos = cursor.position() as usize;
    let buf = cursor.get_ref();
    if pos + 2 > buf.len() || buf[pos] != b'\r' || buf[pos + 1] != b'\n' {
        return Err(Error::Protocol("expected CRLF".into()));
    }
    cursor.advance(2);
    Ok(())
}
