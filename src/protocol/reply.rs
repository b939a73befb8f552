//! Decoded server replies.

use crate::error::{Error, Result, ServerError};
use bytes::Bytes;
use std::fmt;

/// A reply read from the wire.
///
/// Status lines are split three ways: `+OK` and `+QUEUED` get their own
/// variants because callers branch on them constantly, anything else keeps
/// its text. Null bulk strings and null arrays both decode to [`Reply::Nil`];
/// a zero-length bulk string is `Bulk` with empty data and `*0` is an empty
/// `Array`.
#[derive(Clone, PartialEq, Eq)]
pub enum Reply {
    /// `+OK`
    Ok,

    /// `+QUEUED`, acknowledgement of a command inside `MULTI`
    Queued,

    /// Any other status line
    Status(String),

    /// Error reply
    Error(ServerError),

    /// 64-bit signed integer
    Integer(i64),

    /// Bulk string (binary-safe)
    Bulk(Bytes),

    /// Null bulk string or null array
    Nil,

    /// Array of replies
    Array(Vec<Reply>),
}

impl Reply {
    /// Build a reply from a status line.
    pub fn status(line: &str) -> Self {
        match line {
            "OK" => Self::Ok,
            "QUEUED" => Self::Queued,
            other => Self::Status(other.to_string()),
        }
    }

    /// Create an error reply.
    #[inline]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ServerError::new(message))
    }

    /// Create a bulk string reply.
    #[inline]
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Self::Bulk(data.into())
    }

    /// Check if this is a null reply.
    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    /// Check if this is an error reply.
    #[inline]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Try to get the reply as a string slice.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Ok => Some("OK"),
            Self::Queued => Some("QUEUED"),
            Self::Status(s) => Some(s),
            Self::Error(e) => Some(e.message()),
            Self::Bulk(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Try to get the reply as bytes.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Status(s) => Some(s.as_bytes()),
            Self::Bulk(b) => Some(b),
            _ => None,
        }
    }

    /// Try to get the reply as an integer.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            Self::Bulk(b) => std::str::from_utf8(b).ok()?.parse().ok(),
            _ => None,
        }
    }

    /// Try to get the reply as an array.
    pub fn as_array(&self) -> Option<&[Reply]> {
        match self {
            Self::Array(arr) => Some(arr),
            _ => None,
        }
    }

    /// Turn an error reply into `Err`, keeping every other reply.
    pub fn into_result(self) -> Result<Reply> {
        match self {
            Self::Error(e) => Err(Error::Server(e)),
            other => Ok(other),
        }
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "Ok"),
            Self::Queued => write!(f, "Queued"),
            Self::Status(s) => write!(f, "Status({s:?})"),
            Self::Error(e) => write!(f, "Error({:?})", e.message()),
            Self::Integer(n) => write!(f, "Integer({n})"),
            Self::Bulk(b) => {
                if let Ok(s) = std::str::from_utf8(b) {
                    write!(f, "Bulk({s:?})")
                } else {
                    write!(f, "Bulk({b:?})")
                }
            }
            Self::Nil => write!(f, "Nil"),
            Self::Array(arr) => f.debug_list().entries(arr).finish(),
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::Queued => write!(f, "QUEUED"),
            Self::Status(s) => write!(f, "{s}"),
            Self::Error(e) => write!(f, "(error) {}", e.message()),
            Self::Integer(n) => write!(f, "(integer) {n}"),
            Self::Bulk(b) => match std::str::from_utf8(b) {
                Ok(s) => write!(f, "\"{s}\""),
                Err(_) => write!(f, "<{} bytes>", b.len()),
            },
            Self::Nil => write!(f, "(nil)"),
            Self::Array(arr) => {
                if arr.is_empty() {
                    return write!(f, "(empty array)");
                }
                for (i, reply) in arr.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}) {reply}", i + 1)?;
                }
                Ok(())
            }
        }
    }
}

impl From<&str> for Reply {
    fn from(s: &str) -> Self {
        Self::Bulk(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<i64> for Reply {
    fn from(n: i64) -> Self {
        Self::Integer(n)
    }
}

impl From<Vec<Reply>> for Reply {
    fn from(replies: Vec<Reply>) -> Self {
        Self::Array(replies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(Reply::status("OK"), Reply::Ok);
        assert_eq!(Reply::status("QUEUED"), Reply::Queued);
        assert_eq!(Reply::status("PONG"), Reply::Status("PONG".to_string()));
    }

    #[test]
    fn test_into_result() {
        assert!(Reply::error("ERR boom").into_result().is_err());
        assert_eq!(Reply::Integer(3).into_result().unwrap(), Reply::Integer(3));
    }

    #[test]
    fn test_display() {
        let reply = Reply::Array(vec![Reply::from("a"), Reply::Integer(2), Reply::Nil]);
        assert_eq!(reply.to_string(), "1) \"a\"\n2) (integer) 2\n3) (nil)");
    }
}
