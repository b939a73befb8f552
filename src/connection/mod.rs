//! Connections.
//!
//! Everything that can execute a command implements [`Connection`]: a
//! single socket ([`StreamConnection`]) as well as the routing aggregates
//! built on top of node connections (sharded cluster, server-assisted
//! cluster, replication). Node connections additionally implement
//! [`NodeConnection`] and are created through a [`ConnectionFactory`].
//!
//! A connection is strictly request/response and not reentrant; it is
//! `Send` so it can move between threads, never shared between them.

pub mod iter;
#[cfg(test)]
pub(crate) mod mock;
pub mod parameters;
pub mod stream;

pub use iter::{MultiBulkIter, MultiBulkTuples};
pub use parameters::{ConnectionParameters, Role, Scheme};
pub use stream::{StreamConnection, Streamed};

use crate::command::Command;
use crate::error::Result;
use crate::protocol::Reply;
use bytes::Bytes;

/// How a connection aggregates nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    /// One node
    Single,
    /// Client-side sharding
    Sharded,
    /// Server-assisted cluster
    Cluster,
    /// Primary and replicas
    Replication,
}

impl Aggregation {
    /// Human-readable name used in routing errors.
    pub fn describe(self) -> &'static str {
        match self {
            Self::Single => "a single connection",
            Self::Sharded => "a cluster of connections",
            Self::Cluster => "a cluster of connections",
            Self::Replication => "a replication group",
        }
    }
}

/// Something that executes commands against one or more nodes.
pub trait Connection: Send {
    /// Open the transport(s). Connecting an open connection is a no-op.
    fn connect(&mut self) -> Result<()>;

    /// Close the transport(s). Always safe to call.
    fn disconnect(&mut self);

    /// Returns true if a transport is open.
    fn is_connected(&self) -> bool;

    /// Write a command without reading its reply.
    fn write_request(&mut self, command: &Command) -> Result<()>;

    /// Read the reply to a previously written command.
    ///
    /// Server error replies come back as [`Reply::Error`]; only transport
    /// and protocol failures are `Err`.
    fn read_response(&mut self, command: &Command) -> Result<Reply>;

    /// Write then read.
    fn execute_command(&mut self, command: &Command) -> Result<Reply> {
        self.write_request(command)?;
        self.read_response(command)
    }

    /// Id of the node `command` is routed to.
    fn node_id(&mut self, command: &Command) -> Result<String>;

    /// Aggregation kind.
    fn aggregation(&self) -> Aggregation {
        Aggregation::Single
    }

    /// Route every following command to the primary, where that applies.
    fn switch_to_primary(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A connection to exactly one node.
pub trait NodeConnection: Connection {
    /// Parameters this connection was created with.
    fn parameters(&self) -> &ConnectionParameters;

    /// Queue a command replayed every time the transport (re)opens.
    fn add_connect_command(&mut self, command: Command);

    /// Node identity (alias or endpoint).
    fn id(&self) -> String {
        self.parameters().id()
    }
}

/// Boxed node connection owned by the routing aggregates.
pub type BoxedNode = Box<dyn NodeConnection>;

// Lets a lone node stand in wherever a `dyn Connection` is expected.
impl Connection for BoxedNode {
    fn connect(&mut self) -> Result<()> {
        (**self).connect()
    }

    fn disconnect(&mut self) {
        (**self).disconnect();
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn write_request(&mut self, command: &Command) -> Result<()> {
        (**self).write_request(command)
    }

    fn read_response(&mut self, command: &Command) -> Result<Reply> {
        (**self).read_response(command)
    }

    fn execute_command(&mut self, command: &Command) -> Result<Reply> {
        (**self).execute_command(command)
    }

    fn node_id(&mut self, command: &Command) -> Result<String> {
        (**self).node_id(command)
    }

    fn aggregation(&self) -> Aggregation {
        (**self).aggregation()
    }

    fn switch_to_primary(&mut self) -> Result<()> {
        (**self).switch_to_primary()
    }
}

/// Creates node connections from parameters.
pub trait ConnectionFactory: Send + Sync {
    /// Create an unconnected node connection.
    fn create(&self, params: ConnectionParameters) -> Result<BoxedNode>;
}

/// Factory for socket connections.
///
/// Queues `AUTH` and `SELECT` on every created connection when the
/// parameters carry credentials or a database.
#[derive(Debug, Clone, Default)]
pub struct StreamFactory;

impl StreamFactory {
    /// Create a new factory.
    pub fn new() -> Self {
        Self
    }
}

impl ConnectionFactory for StreamFactory {
    fn create(&self, params: ConnectionParameters) -> Result<BoxedNode> {
        let init = init_commands(&params);
        let mut connection = StreamConnection::new(params);
        for command in init {
            connection.add_connect_command(command);
        }
        Ok(Box::new(connection))
    }
}

/// `AUTH` and `SELECT` derived from parameters.
pub fn init_commands(params: &ConnectionParameters) -> Vec<Command> {
    let mut commands = Vec::new();
    if let Some(ref password) = params.password {
        let mut args = Vec::with_capacity(2);
        if let Some(ref username) = params.username {
            args.push(Bytes::from(username.clone()));
        }
        args.push(Bytes::from(password.clone()));
        commands.push(Command::raw("AUTH", args));
    }
    if let Some(database) = params.database {
        if database != 0 {
            commands.push(Command::raw("SELECT", vec![Bytes::from(database.to_string())]));
        }
    }
    commands
}
