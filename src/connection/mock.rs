//! Scripted in-memory connections for unit tests.

use super::{BoxedNode, Connection, ConnectionFactory, ConnectionParameters, NodeConnection};
use crate::command::Command;
use crate::error::{Error, Result};
use crate::protocol::Reply;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Computes the reply for `(node endpoint, command)`.
pub(crate) type Responder = Arc<dyn Fn(&str, &Command) -> Result<Reply> + Send + Sync>;

/// Shared record of `"<endpoint> <ID> <args...>"` lines, in write order.
#[derive(Clone, Default)]
pub(crate) struct Log(Arc<Mutex<Vec<String>>>);

impl Log {
    pub(crate) fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub(crate) fn clear(&self) {
        self.0.lock().clear();
    }

    fn push(&self, endpoint: &str, command: &Command) {
        self.0.lock().push(render(endpoint, command));
    }
}

/// Render a command the way [`Log`] records it.
pub(crate) fn render(endpoint: &str, command: &Command) -> String {
    let mut line = format!("{endpoint} {}", command.id());
    for argument in command.arguments() {
        line.push(' ');
        line.push_str(&String::from_utf8_lossy(argument));
    }
    line
}

/// Reply `OK` to everything.
pub(crate) fn always_ok() -> Responder {
    Arc::new(|_, _| Ok(Reply::Ok))
}

/// Pop replies in order, then `OK`.
pub(crate) fn scripted(replies: Vec<Result<Reply>>) -> Responder {
    let queue = Mutex::new(VecDeque::from(replies));
    Arc::new(move |_, _| queue.lock().pop_front().unwrap_or(Ok(Reply::Ok)))
}

pub(crate) struct MockConnection {
    params: ConnectionParameters,
    connected: bool,
    pending: VecDeque<Command>,
    responder: Responder,
    log: Log,
    init_commands: Vec<Command>,
}

impl MockConnection {
    pub(crate) fn new(endpoint: &str, responder: Responder, log: Log) -> Self {
        Self::with_parameters(ConnectionParameters::parse(endpoint).unwrap(), responder, log)
    }

    pub(crate) fn with_parameters(
        params: ConnectionParameters,
        responder: Responder,
        log: Log,
    ) -> Self {
        Self {
            params,
            connected: false,
            pending: VecDeque::new(),
            responder,
            log,
            init_commands: Vec::new(),
        }
    }

    pub(crate) fn boxed(endpoint: &str, responder: Responder, log: Log) -> BoxedNode {
        Box::new(Self::new(endpoint, responder, log))
    }
}

impl Connection for MockConnection {
    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.connected = false;
        self.pending.clear();
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn write_request(&mut self, command: &Command) -> Result<()> {
        self.connected = true;
        self.log.push(&self.params.endpoint(), command);
        self.pending.push_back(command.clone());
        Ok(())
    }

    fn read_response(&mut self, _command: &Command) -> Result<Reply> {
        let endpoint = self.params.endpoint();
        let Some(written) = self.pending.pop_front() else {
            return Err(Error::connection(endpoint, "nothing to read"));
        };
        let result = (self.responder)(&endpoint, &written);
        if matches!(&result, Err(e) if e.is_communication()) {
            self.disconnect();
        }
        result
    }

    fn node_id(&mut self, _command: &Command) -> Result<String> {
        Ok(self.params.id())
    }
}

impl NodeConnection for MockConnection {
    fn parameters(&self) -> &ConnectionParameters {
        &self.params
    }

    fn add_connect_command(&mut self, command: Command) {
        self.init_commands.push(command);
    }
}

/// Factory handing out [`MockConnection`]s that share one responder and log.
#[derive(Clone)]
pub(crate) struct MockFactory {
    pub(crate) responder: Responder,
    pub(crate) log: Log,
    pub(crate) created: Arc<Mutex<Vec<ConnectionParameters>>>,
}

impl MockFactory {
    pub(crate) fn new(responder: Responder) -> Self {
        Self {
            responder,
            log: Log::default(),
            created: Arc::default(),
        }
    }

    pub(crate) fn created(&self) -> Vec<ConnectionParameters> {
        self.created.lock().clone()
    }
}

impl ConnectionFactory for MockFactory {
    fn create(&self, params: ConnectionParameters) -> Result<BoxedNode> {
        self.created.lock().push(params.clone());
        Ok(Box::new(MockConnection::with_parameters(
            params,
            Arc::clone(&self.responder),
            self.log.clone(),
        )))
    }
}
