//! Error types for cairn.
//!
//! The taxonomy mirrors how a failure affects the connection it happened on:
//! transport and protocol failures poison the stream and always close it,
//! server error replies leave it usable, routing and transaction errors are
//! raised before (or instead of) any I/O.

use crate::config::ConfigError;
use std::num::ParseIntError;
use thiserror::Error;

/// Result type alias for cairn operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for cairn.
///
/// Every variant is cheap to clone so that batch executors can record the
/// same failure against several pending commands.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Transport could not be established or failed mid-use.
    #[error("connection error [{endpoint}]: {message}")]
    Connection {
        /// Endpoint descriptor of the failing connection (`host:port` or socket path)
        endpoint: String,
        /// What went wrong
        message: String,
    },

    /// Malformed or unexpected bytes on the wire.
    #[error("protocol error [{endpoint}]: {source}")]
    Protocol {
        /// Endpoint descriptor of the failing connection
        endpoint: String,
        /// Underlying parse failure
        #[source]
        source: ProtocolError,
    },

    /// Well-formed error reply returned by the server.
    #[error("{0}")]
    Server(#[from] ServerError),

    /// The command cannot be routed under the current aggregation mode.
    #[error("{0}")]
    Routing(String),

    /// `EXEC` returned a null reply because a watched key changed.
    #[error("transaction aborted: {0}")]
    Aborted(String),

    /// The API was used in a way that is not allowed.
    #[error("client error: {0}")]
    Client(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl Error {
    /// Build a connection error for `endpoint`.
    pub fn connection(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Connection {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Build a protocol error for `endpoint`.
    pub fn protocol(endpoint: impl Into<String>, source: ProtocolError) -> Self {
        Error::Protocol {
            endpoint: endpoint.into(),
            source,
        }
    }

    /// Build a routing error for a command that cannot be dispatched.
    pub fn not_supported(command_id: &str, mode: &str) -> Self {
        Error::Routing(format!("Cannot use '{command_id}' over {mode}"))
    }

    /// Returns true for transport and protocol failures.
    #[inline]
    pub fn is_communication(&self) -> bool {
        matches!(self, Error::Connection { .. } | Error::Protocol { .. })
    }

    /// Returns true if the owning connection must be closed before reuse.
    ///
    /// Communication errors always leave the stream in an unknown position.
    #[inline]
    pub fn should_reset_connection(&self) -> bool {
        self.is_communication()
    }

    /// Returns true if this is an error reply sent by the server.
    #[inline]
    pub fn is_server(&self) -> bool {
        matches!(self, Error::Server(_))
    }

    /// Endpoint of the connection that failed, if known.
    pub fn endpoint(&self) -> Option<&str> {
        match self {
            Error::Connection { endpoint, .. } | Error::Protocol { endpoint, .. } => {
                Some(endpoint)
            }
            _ => None,
        }
    }
}

/// Protocol-level errors during reply parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Invalid reply type marker
    #[error("invalid type marker: {0:?}")]
    InvalidTypeMarker(u8),

    /// Invalid UTF-8 in a status or error line
    #[error("invalid UTF-8 in string")]
    InvalidUtf8,

    /// Invalid integer format
    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    /// Invalid bulk string length
    #[error("invalid bulk string length: {0}")]
    InvalidBulkLength(i64),

    /// Invalid array length
    #[error("invalid array length: {0}")]
    InvalidArrayLength(i64),

    /// Bulk string too large
    #[error("bulk string too large: {len} bytes (max: {max})")]
    BulkTooLarge {
        /// Announced length in bytes
        len: usize,
        /// Maximum allowed length
        max: usize,
    },

    /// Too many array elements
    #[error("too many array elements: {count} (max: {max})")]
    TooManyElements {
        /// Announced element count
        count: usize,
        /// Maximum allowed count
        max: usize,
    },

    /// Arrays nested deeper than the parser accepts
    #[error("arrays nested too deeply (max depth: {max})")]
    NestingTooDeep {
        /// Maximum allowed depth
        max: usize,
    },

    /// Missing CRLF terminator after a bulk payload
    #[error("missing CRLF terminator")]
    MissingCrlf,

    /// A well-formed reply arrived where the exchange did not allow it
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    /// Incomplete frame - need more data
    #[error("incomplete frame, need more data")]
    Incomplete,
}

impl From<ParseIntError> for ProtocolError {
    fn from(e: ParseIntError) -> Self {
        ProtocolError::InvalidInteger(e.to_string())
    }
}

/// An error reply (`-...`) sent by the server.
///
/// By convention the first whitespace-delimited token is the error kind
/// (`ERR`, `WRONGTYPE`, `MOVED`, ...) and the remainder is free-form detail.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ServerError {
    message: String,
}

impl ServerError {
    /// Wrap an error reply message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The full message as sent by the server.
    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The error kind tag (first token).
    pub fn kind(&self) -> &str {
        self.message.split_whitespace().next().unwrap_or("")
    }

    /// Everything after the kind tag.
    pub fn detail(&self) -> &str {
        match self.message.split_once(' ') {
            Some((_, rest)) => rest.trim_start(),
            None => "",
        }
    }

    /// Parse a cluster redirection (`MOVED <slot> <host:port>` or `ASK ...`).
    pub fn redirection(&self) -> Option<Redirection> {
        let kind = match self.kind() {
            "MOVED" => RedirectKind::Moved,
            "ASK" => RedirectKind::Ask,
            _ => return None,
        };
        let mut parts = self.detail().splitn(2, ' ');
        let slot = parts.next()?.parse().ok()?;
        let addr = parts.next()?.trim();
        if addr.is_empty() {
            return None;
        }
        Some(Redirection {
            kind,
            slot,
            addr: addr.to_string(),
        })
    }
}

/// Kind of cluster redirection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectKind {
    /// Slot ownership changed permanently
    Moved,
    /// Slot is being migrated; retry once on the target after `ASKING`
    Ask,
}

/// A parsed `MOVED`/`ASK` error payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirection {
    /// Redirection kind
    pub kind: RedirectKind,
    /// Hash slot named by the server
    pub slot: u16,
    /// Target node address (`host:port`)
    pub addr: String,
}
