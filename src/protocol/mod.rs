//! Wire codec for the RESP2 request/reply protocol.
//!
//! Requests are always encoded as arrays of length-prefixed bulk strings,
//! which makes every argument binary-safe. Replies are decoded
//! incrementally from a buffer that the owning connection fills.

mod parser;
mod reply;
mod request;

pub use parser::{Header, ReplyParser, parse_reply};
pub use reply::Reply;
pub use request::{encode_command, encoded_len};

/// CRLF terminator bytes.
pub const CRLF: &[u8] = b"\r\n";

/// Type markers for RESP.
pub mod markers {
    /// Simple string: +
    pub const SIMPLE_STRING: u8 = b'+';
    /// Error: -
    pub const ERROR: u8 = b'-';
    /// Integer: :
    pub const INTEGER: u8 = b':';
    /// Bulk string: $
    pub const BULK_STRING: u8 = b'$';
    /// Array: *
    pub const ARRAY: u8 = b'*';
}
