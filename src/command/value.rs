//! Caller-facing values produced by response post-processing.

use crate::error::{Error, Result};
use crate::protocol::Reply;
use bytes::Bytes;
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use std::fmt;

/// A reply after command-specific post-processing.
///
/// Server error replies become [`Value::Error`] only when the caller asked
/// for errors inline (non-throwing mode or batch results); otherwise they
/// surface as `Err(Error::Server)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Null reply
    Nil,
    /// `+OK`
    Okay,
    /// `+QUEUED`
    Queued,
    /// Other status text
    Status(String),
    /// Integer reply
    Int(i64),
    /// Integer reply folded into a boolean
    Bool(bool),
    /// Bulk string
    Data(Bytes),
    /// Array of values
    Array(Vec<Value>),
    /// Flat array folded pair-wise, in server order
    Map(Vec<(Value, Value)>),
    /// Error recorded inline
    Error(Error),
}

impl Value {
    /// Check if this is a null value.
    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    /// Check if this value carries an error.
    #[inline]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Try to get the value as bytes.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Data(b) => Some(b),
            Self::Status(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Try to get the value as a string slice.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Okay => Some("OK"),
            Self::Queued => Some("QUEUED"),
            Self::Status(s) => Some(s),
            Self::Data(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Try to get the value as an integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            Self::Bool(b) => Some(i64::from(*b)),
            Self::Data(b) => std::str::from_utf8(b).ok()?.parse().ok(),
            _ => None,
        }
    }

    /// Try to get the value as a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int(n) => Some(*n != 0),
            Self::Okay => Some(true),
            _ => None,
        }
    }

    /// Try to get the value as a slice of values.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Look up a key in a [`Value::Map`].
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        match self {
            Self::Map(pairs) => pairs
                .iter()
                .find(|(k, _)| k.as_bytes() == Some(key))
                .map(|(_, v)| v),
            _ => None,
        }
    }

    /// Turn an inline error into `Err`, keeping every other value.
    pub fn into_result(self) -> Result<Value> {
        match self {
            Self::Error(e) => Err(e),
            other => Ok(other),
        }
    }
}

impl From<Reply> for Value {
    fn from(reply: Reply) -> Self {
        match reply {
            Reply::Ok => Self::Okay,
            Reply::Queued => Self::Queued,
            Reply::Status(s) => Self::Status(s),
            Reply::Error(e) => Self::Error(Error::Server(e)),
            Reply::Integer(n) => Self::Int(n),
            Reply::Bulk(b) => Self::Data(b),
            Reply::Nil => Self::Nil,
            Reply::Array(items) => Self::Array(items.into_iter().map(Value::from).collect()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => write!(f, "(nil)"),
            Self::Okay => write!(f, "OK"),
            Self::Queued => write!(f, "QUEUED"),
            Self::Status(s) => write!(f, "{s}"),
            Self::Int(n) => write!(f, "(integer) {n}"),
            Self::Bool(b) => write!(f, "({b})"),
            Self::Data(b) => match std::str::from_utf8(b) {
                Ok(s) => write!(f, "\"{s}\""),
                Err(_) => write!(f, "<{} bytes>", b.len()),
            },
            Self::Array(items) if items.is_empty() => write!(f, "(empty array)"),
            Self::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}) {item}", i + 1)?;
                }
                Ok(())
            }
            Self::Map(pairs) if pairs.is_empty() => write!(f, "(empty map)"),
            Self::Map(pairs) => {
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}) {k} => {v}", i + 1)?;
                }
                Ok(())
            }
            Self::Error(e) => write!(f, "(error) {e}"),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Nil => serializer.serialize_none(),
            Self::Okay => serializer.serialize_str("OK"),
            Self::Queued => serializer.serialize_str("QUEUED"),
            Self::Status(s) => serializer.serialize_str(s),
            Self::Int(n) => serializer.serialize_i64(*n),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Data(b) => match std::str::from_utf8(b) {
                Ok(s) => serializer.serialize_str(s),
                Err(_) => serializer.serialize_bytes(b),
            },
            Self::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Self::Map(pairs) => {
                let mut map = serializer.serialize_map(Some(pairs.len()))?;
                for (k, v) in pairs {
                    map.serialize_entry(&k.to_string(), v)?;
                }
                map.end()
            }
            Self::Error(e) => serializer.serialize_str(&e.to_string()),
        }
    }
}
