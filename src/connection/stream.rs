//! Socket connection to one node.

use super::iter::MultiBulkIter;
use super::parameters::{ConnectionParameters, Scheme};
use super::{Connection, NodeConnection};
use crate::command::Command;
use crate::error::{Error, ProtocolError, Result};
use crate::protocol::{encode_command, Header, Reply, ReplyParser};
use bytes::BytesMut;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use tracing::{debug, warn};

const READ_CHUNK: usize = 16 * 1024;

enum Transport {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Transport {
    fn shutdown(&self) {
        let _ = match self {
            Self::Tcp(s) => s.shutdown(Shutdown::Both),
            #[cfg(unix)]
            Self::Unix(s) => s.shutdown(Shutdown::Both),
        };
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Self::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Self::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.flush(),
            #[cfg(unix)]
            Self::Unix(s) => s.flush(),
        }
    }
}

/// A reply read without materializing a top-level array.
pub enum Streamed<'a> {
    /// Any non-array reply, including a null array
    Reply(Reply),
    /// An array whose elements are still on the wire
    Array(MultiBulkIter<'a>),
}

/// Blocking TCP or Unix socket connection.
///
/// The transport opens lazily on first use. Any I/O or protocol failure
/// closes it and marks the connection failed: further commands are refused
/// until [`Connection::connect`] (or [`Connection::disconnect`]) is called
/// explicitly.
pub struct StreamConnection {
    params: ConnectionParameters,
    transport: Option<Transport>,
    parser: ReplyParser,
    write_buf: BytesMut,
    init_commands: Vec<Command>,
    failed: bool,
}

impl StreamConnection {
    /// Create an unconnected connection.
    pub fn new(params: ConnectionParameters) -> Self {
        Self {
            params,
            transport: None,
            parser: ReplyParser::new(),
            write_buf: BytesMut::with_capacity(4096),
            init_commands: Vec::new(),
            failed: false,
        }
    }

    /// Endpoint descriptor used in error messages.
    pub fn endpoint(&self) -> String {
        self.params.endpoint()
    }

    /// Initialization commands replayed on connect.
    pub fn connect_commands(&self) -> &[Command] {
        &self.init_commands
    }

    /// Read the next reply, leaving a top-level array on the wire.
    ///
    /// The returned iterator borrows the connection; drain it or drop it
    /// (which disconnects) before issuing another command.
    pub fn read_response_streamed(&mut self) -> Result<Streamed<'_>> {
        match self.read_header()? {
            Header::Reply(reply) => Ok(Streamed::Reply(reply)),
            Header::Array(len) => Ok(Streamed::Array(MultiBulkIter::new(self, len))),
        }
    }

    pub(crate) fn read_reply(&mut self) -> Result<Reply> {
        self.read_with(ReplyParser::parse)
    }

    fn read_header(&mut self) -> Result<Header> {
        self.read_with(ReplyParser::parse_header)
    }

    fn read_with<T>(
        &mut self,
        parse: fn(&mut ReplyParser) -> std::result::Result<Option<T>, ProtocolError>,
    ) -> Result<T> {
        if self.transport.is_none() {
            return Err(self.closed_error());
        }
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match parse(&mut self.parser) {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => {}
                Err(e) => return Err(self.fail_protocol(e)),
            }

            let read = match self.transport.as_mut() {
                Some(transport) => transport.read(&mut chunk),
                None => return Err(self.closed_error()),
            };
            match read {
                Ok(0) => return Err(self.fail("connection closed by server")),
                Ok(n) => self.parser.extend(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(self.fail_io("read", &e)),
            }
        }
    }

    fn ensure_connected(&mut self) -> Result<()> {
        if self.transport.is_some() {
            return Ok(());
        }
        if self.failed {
            return Err(self.closed_error());
        }
        self.open()
    }

    fn open(&mut self) -> Result<()> {
        let transport = match self.params.scheme {
            Scheme::Tcp => self.open_tcp()?,
            Scheme::Unix => self.open_unix()?,
        };
        self.transport = Some(transport);
        self.failed = false;
        self.parser.clear();
        debug!(endpoint = %self.endpoint(), "connected");

        if !self.init_commands.is_empty() {
            self.replay_init_commands()?;
        }
        Ok(())
    }

    fn open_tcp(&self) -> Result<Transport> {
        let endpoint = self.endpoint();
        let addrs = (self.params.host.as_str(), self.params.port)
            .to_socket_addrs()
            .map_err(|e| Error::connection(&endpoint, format!("cannot resolve host: {e}")))?;

        let timeout = self.params.connect_timeout();
        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    let configured = stream
                        .set_nodelay(true)
                        .and_then(|()| stream.set_read_timeout(self.params.read_write_timeout))
                        .and_then(|()| stream.set_write_timeout(self.params.read_write_timeout));
                    if let Err(e) = configured {
                        return Err(Error::connection(&endpoint, e.to_string()));
                    }
                    return Ok(Transport::Tcp(stream));
                }
                Err(e) => last_error = Some(e),
            }
        }
        let message = match last_error {
            Some(e) => e.to_string(),
            None => "host resolved to no addresses".to_string(),
        };
        Err(Error::connection(endpoint, message))
    }

    #[cfg(unix)]
    fn open_unix(&self) -> Result<Transport> {
        let endpoint = self.endpoint();
        let path = self
            .params
            .path
            .as_ref()
            .ok_or_else(|| Error::connection(&endpoint, "missing socket path"))?;
        let stream =
            UnixStream::connect(path).map_err(|e| Error::connection(&endpoint, e.to_string()))?;
        stream
            .set_read_timeout(self.params.read_write_timeout)
            .and_then(|()| stream.set_write_timeout(self.params.read_write_timeout))
            .map_err(|e| Error::connection(&endpoint, e.to_string()))?;
        Ok(Transport::Unix(stream))
    }

    #[cfg(not(unix))]
    fn open_unix(&self) -> Result<Transport> {
        Err(Error::connection(
            self.endpoint(),
            "unix sockets are not supported on this platform",
        ))
    }

    /// Write every init command, then read every reply.
    fn replay_init_commands(&mut self) -> Result<()> {
        let commands = std::mem::take(&mut self.init_commands);
        let result = self.replay(&commands);
        self.init_commands = commands;
        result
    }

    fn replay(&mut self, commands: &[Command]) -> Result<()> {
        debug!(endpoint = %self.endpoint(), count = commands.len(), "replaying init commands");
        for command in commands {
            self.write_raw(command)?;
        }
        for command in commands {
            if let Reply::Error(e) = self.read_reply()? {
                let message = format!("{} failed during connect: {}", command.id(), e.message());
                warn!(endpoint = %self.endpoint(), "{message}");
                self.close();
                self.failed = true;
                return Err(Error::connection(self.endpoint(), message));
            }
        }
        Ok(())
    }

    fn write_raw(&mut self, command: &Command) -> Result<()> {
        self.write_buf.clear();
        encode_command(&mut self.write_buf, command.id(), command.arguments());
        let written = match self.transport.as_mut() {
            Some(transport) => transport.write_all(&self.write_buf),
            None => return Err(self.closed_error()),
        };
        written.map_err(|e| self.fail_io("write", &e))
    }

    fn close(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.shutdown();
            debug!(endpoint = %self.endpoint(), "disconnected");
        }
        self.parser.clear();
    }

    fn fail(&mut self, message: &str) -> Error {
        warn!(endpoint = %self.endpoint(), "{message}; closing connection");
        self.close();
        self.failed = true;
        Error::connection(self.endpoint(), message)
    }

    fn fail_io(&mut self, op: &str, e: &io::Error) -> Error {
        let message = match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => format!("{op} timed out"),
            _ => format!("{op} error: {e}"),
        };
        self.fail(&message)
    }

    fn fail_protocol(&mut self, e: ProtocolError) -> Error {
        warn!(endpoint = %self.endpoint(), error = %e, "protocol error; closing connection");
        self.close();
        self.failed = true;
        Error::protocol(self.endpoint(), e)
    }

    fn closed_error(&self) -> Error {
        let message = if self.failed {
            "connection closed after a previous error"
        } else {
            "not connected"
        };
        Error::connection(self.endpoint(), message)
    }
}

impl Connection for StreamConnection {
    fn connect(&mut self) -> Result<()> {
        if self.transport.is_some() {
            return Ok(());
        }
        self.open()
    }

    fn disconnect(&mut self) {
        self.close();
        self.failed = false;
    }

    fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    fn write_request(&mut self, command: &Command) -> Result<()> {
        self.ensure_connected()?;
        self.write_raw(command)
    }

    fn read_response(&mut self, _command: &Command) -> Result<Reply> {
        self.read_reply()
    }

    fn node_id(&mut self, _command: &Command) -> Result<String> {
        Ok(self.params.id())
    }
}

impl NodeConnection for StreamConnection {
    fn parameters(&self) -> &ConnectionParameters {
        &self.params
    }

    fn add_connect_command(&mut self, command: Command) {
        self.init_commands.push(command);
    }
}

impl std::fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConnection")
            .field("endpoint", &self.endpoint())
            .field("connected", &self.is_connected())
            .field("failed", &self.failed)
            .field("init_commands", &self.init_commands.len())
            .finish()
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        self.close();
    }
}
