//! RESP reply parser.
//!
//! This parser is designed for:
//! - Streaming input: bytes are appended as they arrive and a reply is only
//!   consumed from the buffer once it is complete
//! - Security: bounded allocations for announced lengths
//! - Lazy arrays: an array header can be consumed on its own so elements
//!   are pulled one at a time

use super::markers;
use super::reply::Reply;
use crate::error::ProtocolError;
use crate::{MAX_ARRAY_LEN, MAX_BULK_SIZE, MAX_NESTING_DEPTH};
use bytes::{Buf, Bytes, BytesMut};
use memchr::memchr;

/// Result of reading the head of a reply without descending into arrays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    /// An array of the given length follows; its elements are still unread
    Array(usize),
    /// A complete non-array reply (including a null array)
    Reply(Reply),
}

/// RESP reply parser with streaming support.
///
/// # Usage
///
/// ```ignore
/// let mut parser = ReplyParser::new();
/// parser.extend(data);
///
/// while let Some(reply) = parser.parse()? {
///     // Handle reply
/// }
/// ```
#[derive(Debug, Default)]
pub struct ReplyParser {
    buffer: BytesMut,
}

impl ReplyParser {
    /// Create a new parser.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Add data to the parser buffer.
    #[inline]
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Returns true if the buffer is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Returns the number of buffered bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Drop everything buffered.
    #[inline]
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Try to parse a complete reply from the buffer.
    ///
    /// Returns:
    /// - `Ok(Some(reply))` if a complete reply was parsed and consumed
    /// - `Ok(None)` if more data is needed; nothing is consumed
    /// - `Err(e)` if the data is malformed
    pub fn parse(&mut self) -> Result<Option<Reply>, ProtocolError> {
        let mut cursor = Cursor::new(&self.buffer);
        match cursor.reply() {
            Ok(reply) => {
                let consumed = cursor.pos;
                self.buffer.advance(consumed);
                Ok(Some(reply))
            }
            Err(ProtocolError::Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Try to parse the head of the next reply.
    ///
    /// For an array only the `*<len>` line is consumed and the elements are
    /// left for subsequent [`parse`](Self::parse) calls.
    pub fn parse_header(&mut self) -> Result<Option<Header>, ProtocolError> {
        let mut cursor = Cursor::new(&self.buffer);
        let header = match cursor.peek() {
            None => return Ok(None),
            Some(markers::ARRAY) => {
                cursor.pos += 1;
                match cursor.length_line() {
                    Ok(-1) => Header::Reply(Reply::Nil),
                    Ok(len) => Header::Array(check_array_len(len)?),
                    Err(ProtocolError::Incomplete) => return Ok(None),
                    Err(e) => return Err(e),
                }
            }
            Some(_) => match cursor.reply() {
                Ok(reply) => Header::Reply(reply),
                Err(ProtocolError::Incomplete) => return Ok(None),
                Err(e) => return Err(e),
            },
        };
        let consumed = cursor.pos;
        self.buffer.advance(consumed);
        Ok(Some(header))
    }
}

/// Read-only view over buffered bytes; the parser advances its buffer only
/// after a whole reply decoded successfully.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0, depth: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    fn reply(&mut self) -> Result<Reply, ProtocolError> {
        let marker = self.peek().ok_or(ProtocolError::Incomplete)?;
        self.pos += 1;

        match marker {
            markers::SIMPLE_STRING => {
                let line = self.line_str()?;
                Ok(Reply::status(line))
            }
            markers::ERROR => {
                let line = self.line_str()?;
                Ok(Reply::error(line))
            }
            markers::INTEGER => {
                let line = self.line_str()?;
                Ok(Reply::Integer(line.parse()?))
            }
            markers::BULK_STRING => self.bulk(),
            markers::ARRAY => self.array(),
            _ => Err(ProtocolError::InvalidTypeMarker(marker)),
        }
    }

    /// Parse a bulk string ($len\r\n...\r\n).
    fn bulk(&mut self) -> Result<Reply, ProtocolError> {
        let len = self.length_line()?;
        if len == -1 {
            return Ok(Reply::Nil);
        }
        if len < 0 {
            return Err(ProtocolError::InvalidBulkLength(len));
        }

        let len = len as usize;
        if len > MAX_BULK_SIZE {
            return Err(ProtocolError::BulkTooLarge {
                len,
                max: MAX_BULK_SIZE,
            });
        }

        let end = self.pos + len;
        if self.buf.len() < end + 2 {
            return Err(ProtocolError::Incomplete);
        }
        if &self.buf[end..end + 2] != b"\r\n" {
            return Err(ProtocolError::MissingCrlf);
        }

        let data = Bytes::copy_from_slice(&self.buf[self.pos..end]);
        self.pos = end + 2;
        Ok(Reply::Bulk(data))
    }

    /// Parse an array (*len\r\n...).
    fn array(&mut self) -> Result<Reply, ProtocolError> {
        let len = self.length_line()?;
        if len == -1 {
            return Ok(Reply::Nil);
        }
        let len = check_array_len(len)?;
        if self.depth >= MAX_NESTING_DEPTH {
            return Err(ProtocolError::NestingTooDeep {
                max: MAX_NESTING_DEPTH,
            });
        }

        self.depth += 1;
        let mut replies = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            replies.push(self.reply()?);
        }
        self.depth -= 1;
        Ok(Reply::Array(replies))
    }

    fn length_line(&mut self) -> Result<i64, ProtocolError> {
        let line = self.line_str()?;
        Ok(line.parse()?)
    }

    fn line_str(&mut self) -> Result<&'a str, ProtocolError> {
        let line = self.line()?;
        std::str::from_utf8(line).map_err(|_| ProtocolError::InvalidUtf8)
    }

    /// Read a line (up to CRLF).
    fn line(&mut self) -> Result<&'a [u8], ProtocolError> {
        let buf: &'a [u8] = self.buf;
        let rest = &buf[self.pos..];
        let end = find_crlf(rest).ok_or(ProtocolError::Incomplete)?;
        self.pos += end + 2;
        Ok(&rest[..end])
    }
}

fn check_array_len(len: i64) -> Result<usize, ProtocolError> {
    if len < 0 {
        return Err(ProtocolError::InvalidArrayLength(len));
    }
    let len = len as usize;
    if len > MAX_ARRAY_LEN {
        return Err(ProtocolError::TooManyElements {
            count: len,
            max: MAX_ARRAY_LEN,
        });
    }
    Ok(len)
}

/// Find CRLF in a byte slice.
///
/// Uses memchr for the `\r` search, then verifies `\n` follows.
#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    let mut offset = 0;
    while offset < buf.len().saturating_sub(1) {
        match memchr(b'\r', &buf[offset..]) {
            Some(pos) => {
                let abs_pos = offset + pos;
                if abs_pos + 1 < buf.len() && buf[abs_pos + 1] == b'\n' {
                    return Some(abs_pos);
                }
                offset = abs_pos + 1;
            }
            None => return None,
        }
    }
    None
}

/// Parse a single reply from a byte slice (for testing and one-shot parsing).
pub fn parse_reply(data: &[u8]) -> Result<Reply, ProtocolError> {
    let mut parser = ReplyParser::new();
    parser.extend(data);
    parser.parse()?.ok_or(ProtocolError::Incomplete)
}
