//! `MULTI`/`EXEC` transactions with optimistic locking.
//!
//! A [`Transaction`] is lazy: nothing is sent until the first command (or
//! an explicit [`Transaction::watch`]/[`Transaction::multi`]). Every command
//! queued after `MULTI` must be acknowledged with `QUEUED`; any other
//! well-formed reply is a protocol violation that closes the connection.
//!
//! With `cas` enabled, commands issued before [`Transaction::multi`] run
//! immediately, so a block can read watched keys and then decide what to
//! queue. A null `EXEC` reply means a watched key changed; it surfaces as
//! [`Error::Aborted`] unless retries are left.

use crate::command::{Argument, Command, CommandTable, KeyPrefix, Value};
use crate::connection::{Aggregation, Connection};
use crate::error::{Error, ProtocolError, Result};
use crate::protocol::Reply;
use bytes::Bytes;
use tracing::{debug, warn};

bitflags::bitflags! {
    /// Transaction state. The empty set is the reset state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct State: u8 {
        /// `WATCH`/`MULTI` were sent as needed
        const INITIALIZED  = 1 << 0;
        /// A user block is running
        const INSIDE_BLOCK = 1 << 1;
        /// `DISCARD` was issued
        const DISCARDED    = 1 << 2;
        /// Commands execute immediately until `MULTI`
        const CAS          = 1 << 3;
        /// Keys are being watched
        const WATCH        = 1 << 4;
    }
}

/// Hook called before each retry with the attempt number (starting at 1).
pub type RetryHook = Box<dyn FnMut(u32) + Send>;

/// Transaction options.
#[derive(Default)]
pub struct TransactionOptions {
    /// Keys to `WATCH` on initialization
    pub watch: Vec<Bytes>,
    /// Run commands immediately until [`Transaction::multi`]
    pub cas: bool,
    /// How many times to rerun the block after an aborted `EXEC`
    pub retry: u32,
    /// Return error replies inside the `EXEC` result as `Err`
    pub exceptions: bool,
    /// Called before each retry
    pub on_retry: Option<RetryHook>,
}

impl TransactionOptions {
    /// Default options: no watch, no CAS, no retry, exceptions on.
    pub fn new() -> Self {
        Self {
            exceptions: true,
            ..Self::default()
        }
    }

    /// Builder: watch keys.
    pub fn watch<I, K>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<Bytes>,
    {
        self.watch = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: enable check-and-set mode.
    pub fn cas(mut self, enabled: bool) -> Self {
        self.cas = enabled;
        self
    }

    /// Builder: retry aborted transactions.
    pub fn retry(mut self, attempts: u32) -> Self {
        self.retry = attempts;
        self
    }

    /// Builder: raise error replies.
    pub fn exceptions(mut self, enabled: bool) -> Self {
        self.exceptions = enabled;
        self
    }

    /// Builder: hook called before each retry.
    pub fn on_retry(mut self, hook: impl FnMut(u32) + Send + 'static) -> Self {
        self.on_retry = Some(Box::new(hook));
        self
    }
}

impl std::fmt::Debug for TransactionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionOptions")
            .field("watch", &self.watch)
            .field("cas", &self.cas)
            .field("retry", &self.retry)
            .field("exceptions", &self.exceptions)
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

/// A transaction bound to a connection.
pub struct Transaction<'a> {
    connection: &'a mut dyn Connection,
    table: &'a CommandTable,
    prefix: Option<&'a KeyPrefix>,
    options: TransactionOptions,
    state: State,
    queued: Vec<Command>,
}

impl<'a> Transaction<'a> {
    /// Start a transaction on `connection`.
    ///
    /// Cluster aggregates are refused; a replication group is switched to
    /// its primary.
    pub fn new(
        connection: &'a mut dyn Connection,
        table: &'a CommandTable,
        prefix: Option<&'a KeyPrefix>,
        options: TransactionOptions,
    ) -> Result<Self> {
        match connection.aggregation() {
            Aggregation::Cluster | Aggregation::Sharded => {
                return Err(Error::Routing(format!(
                    "Cannot initialize a MULTI/EXEC transaction over {}",
                    connection.aggregation().describe()
                )));
            }
            Aggregation::Replication => connection.switch_to_primary()?,
            Aggregation::Single => {}
        }
        let mut transaction = Self {
            connection,
            table,
            prefix,
            options,
            state: State::empty(),
            queued: Vec::new(),
        };
        transaction.reset();
        Ok(transaction)
    }

    /// Current state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Number of queued commands.
    pub fn len(&self) -> usize {
        self.queued.len()
    }

    /// Returns true if no command is queued.
    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    fn reset(&mut self) {
        self.state = State::empty();
        if self.options.cas {
            self.state |= State::CAS;
        }
        self.queued.clear();
    }

    fn multi_sent(&self) -> bool {
        self.state.contains(State::INITIALIZED) && !self.state.contains(State::CAS)
    }

    /// Send `WATCH` (when configured) and `MULTI` (unless in CAS mode).
    fn initialize(&mut self) -> Result<()> {
        if self.state.contains(State::INITIALIZED) {
            return Ok(());
        }
        if !self.options.watch.is_empty() {
            let keys: Vec<Argument> =
                self.options.watch.iter().cloned().map(Argument::from).collect();
            self.send_watch(keys)?;
        }
        if !self.state.contains(State::CAS) {
            self.send_simple("MULTI")?;
        }
        self.state.remove(State::DISCARDED);
        self.state.insert(State::INITIALIZED);
        Ok(())
    }

    fn send_watch(&mut self, keys: Vec<Argument>) -> Result<Value> {
        let command = self.table.create_prefixed("WATCH", keys, self.prefix)?;
        let reply = self.connection.execute_command(&command)?.into_result()?;
        self.state.insert(State::WATCH);
        Ok(command.parse_response(reply))
    }

    fn send_simple(&mut self, id: &str) -> Result<Value> {
        let command = self.table.create(id, Vec::new())?;
        let reply = self.connection.execute_command(&command)?.into_result()?;
        Ok(command.parse_response(reply))
    }

    /// Watch keys. Not allowed once `MULTI` was sent.
    pub fn watch<I, K>(&mut self, keys: I) -> Result<Value>
    where
        I: IntoIterator<Item = K>,
        K: Into<Argument>,
    {
        if self.multi_sent() {
            return Err(Error::Client("Sending WATCH after MULTI is not allowed".into()));
        }
        self.send_watch(keys.into_iter().map(Into::into).collect())
    }

    /// Forget every watched key.
    pub fn unwatch(&mut self) -> Result<Value> {
        let value = self.send_simple("UNWATCH")?;
        self.state.remove(State::WATCH);
        Ok(value)
    }

    /// Start queuing.
    ///
    /// In CAS mode this ends the immediate-execution phase. Otherwise
    /// `MULTI` was already sent (or is sent now) and a second call is an
    /// error.
    pub fn multi(&mut self) -> Result<()> {
        if self.state.contains(State::INITIALIZED) && !self.state.contains(State::CAS) {
            return Err(Error::Client("Nested MULTI calls are not allowed".into()));
        }
        if self.state.contains(State::CAS) {
            if !self.state.contains(State::INITIALIZED) {
                self.initialize()?;
            }
            self.send_simple("MULTI")?;
            self.state.remove(State::CAS);
            return Ok(());
        }
        self.initialize()
    }

    /// Abandon the transaction.
    ///
    /// Inside a block this also makes the block's result `None`.
    pub fn discard(&mut self) -> Result<()> {
        if self.state.contains(State::INITIALIZED) {
            if self.multi_sent() {
                self.send_simple("DISCARD")?;
            } else if self.state.contains(State::WATCH) {
                self.send_simple("UNWATCH")?;
            }
        }
        let inside = self.state & State::INSIDE_BLOCK;
        self.reset();
        self.state |= State::DISCARDED | inside;
        Ok(())
    }

    /// Queue a command (or run it, in the CAS phase).
    ///
    /// Queued commands return [`Value::Queued`].
    pub fn call(&mut self, id: &str, arguments: Vec<Argument>) -> Result<Value> {
        let command = self.table.create_prefixed(id, arguments, self.prefix)?;
        self.enqueue(command)
    }

    /// Queue an already built command.
    pub fn enqueue(&mut self, command: Command) -> Result<Value> {
        self.initialize()?;
        if self.state.contains(State::CAS) {
            let reply = self.connection.execute_command(&command)?;
            return self.finish_reply(&command, reply);
        }
        let reply = self.connection.execute_command(&command)?;
        if let Err(e) = expect_queued(self.connection, &command, reply) {
            if e.is_server() {
                // the server side was discarded already
                let inside = self.state & State::INSIDE_BLOCK;
                self.reset();
                self.state |= State::DISCARDED | inside;
            }
            return Err(e);
        }
        self.queued.push(command);
        Ok(Value::Queued)
    }

    fn finish_reply(&self, command: &Command, reply: Reply) -> Result<Value> {
        match reply {
            Reply::Error(e) if self.options.exceptions => Err(Error::Server(e)),
            Reply::Error(e) => Ok(Value::Error(Error::Server(e))),
            reply => Ok(command.parse_response(reply)),
        }
    }

    /// Send `EXEC` for the commands queued so far.
    ///
    /// Returns `None` if the transaction was discarded. A null `EXEC`
    /// reply is [`Error::Aborted`].
    pub fn exec(&mut self) -> Result<Option<Vec<Value>>> {
        if self.state.contains(State::INSIDE_BLOCK) {
            return Err(Error::Client(
                "Cannot invoke 'exec' inside an active transaction context".into(),
            ));
        }
        match self.exec_once()? {
            None => Ok(None),
            Some(ExecOutcome::Done(values)) => Ok(Some(values)),
            Some(ExecOutcome::Aborted) => Err(aborted()),
        }
    }

    /// Run `block` inside the transaction and commit.
    ///
    /// An aborted `EXEC` reruns the block from a clean state while retries
    /// are left. An error from the block that is neither a communication
    /// nor a server error discards the transaction before propagating.
    pub fn execute<F>(mut self, mut block: F) -> Result<Option<Vec<Value>>>
    where
        F: FnMut(&mut Transaction<'a>) -> Result<()>,
    {
        if !self.queued.is_empty() {
            return Err(Error::Client(
                "Cannot execute a transaction block after queuing commands".into(),
            ));
        }
        let mut attempts = self.options.retry;
        let mut attempt = 0;
        loop {
            self.run_block(&mut block)?;
            match self.exec_once()? {
                None => return Ok(None),
                Some(ExecOutcome::Done(values)) => return Ok(Some(values)),
                Some(ExecOutcome::Aborted) if attempts == 0 => {
                    warn!(attempt, "transaction aborted");
                    return Err(aborted());
                }
                Some(ExecOutcome::Aborted) => {
                    attempts -= 1;
                    attempt += 1;
                    debug!(attempt, "transaction aborted; retrying");
                    self.reset();
                    if let Some(hook) = self.options.on_retry.as_mut() {
                        hook(attempt);
                    }
                }
            }
        }
    }

    fn run_block<F>(&mut self, block: &mut F) -> Result<()>
    where
        F: FnMut(&mut Transaction<'a>) -> Result<()>,
    {
        self.state.insert(State::INSIDE_BLOCK);
        let result = block(self);
        self.state.remove(State::INSIDE_BLOCK);
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_communication() || e.is_server() => Err(e),
            Err(e) => {
                // best effort; the block's error is what the caller sees
                if let Err(discard) = self.discard() {
                    debug!(error = %discard, "discard after block failure failed");
                }
                Err(e)
            }
        }
    }

    fn exec_once(&mut self) -> Result<Option<ExecOutcome>> {
        if self.state.contains(State::DISCARDED) {
            return Ok(None);
        }
        if self.queued.is_empty() {
            if self.state.contains(State::INITIALIZED) {
                self.discard()?;
            }
            self.reset();
            return Ok(Some(ExecOutcome::Done(Vec::new())));
        }
        let exec = self.table.create("EXEC", Vec::new())?;
        let reply = self.connection.execute_command(&exec)?;
        // the server closed the transaction whatever the reply holds
        let queued = std::mem::take(&mut self.queued);
        let keep = self.state & State::INSIDE_BLOCK;
        self.reset();
        self.state |= keep;
        let outcome = match reply {
            Reply::Nil => ExecOutcome::Aborted,
            reply => ExecOutcome::Done(parse_exec(
                self.connection,
                &queued,
                reply,
                self.options.exceptions,
            )?),
        };
        Ok(Some(outcome))
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        // a transaction left open would turn every later reply into QUEUED
        if self.state.contains(State::INITIALIZED) && self.connection.is_connected() {
            debug!(queued = self.queued.len(), "discarding unfinished transaction");
            if let Err(e) = self.discard() {
                warn!(error = %e, "discard of unfinished transaction failed; disconnecting");
                self.connection.disconnect();
            }
        }
    }
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("state", &self.state)
            .field("queued", &self.queued.len())
            .field("options", &self.options)
            .finish()
    }
}

enum ExecOutcome {
    Done(Vec<Value>),
    Aborted,
}

pub(crate) fn aborted() -> Error {
    Error::Aborted("The current transaction has been aborted by the server".into())
}

/// Close `connection` and build a protocol error for an unexpected reply.
pub(crate) fn protocol_violation(
    connection: &mut dyn Connection,
    command: &Command,
    message: String,
) -> Error {
    let endpoint = connection.node_id(command).unwrap_or_default();
    connection.disconnect();
    Error::protocol(endpoint, ProtocolError::UnexpectedReply(message))
}

/// Check the acknowledgement of a command sent after `MULTI`.
///
/// An error reply discards the transaction and is returned as a server
/// error. Anything but `QUEUED` closes the connection.
pub(crate) fn expect_queued(
    connection: &mut dyn Connection,
    command: &Command,
    reply: Reply,
) -> Result<()> {
    match reply {
        Reply::Queued => Ok(()),
        Reply::Error(e) => {
            let discard = Command::raw("DISCARD", Vec::new());
            connection.execute_command(&discard)?;
            Err(Error::Server(e))
        }
        other => Err(protocol_violation(
            connection,
            command,
            format!("expected QUEUED for '{}', got {other}", command.id()),
        )),
    }
}

/// Match an `EXEC` array with the queued commands.
pub(crate) fn parse_exec(
    connection: &mut dyn Connection,
    queued: &[Command],
    reply: Reply,
    exceptions: bool,
) -> Result<Vec<Value>> {
    let exec = Command::raw("EXEC", Vec::new());
    let items = match reply {
        Reply::Array(items) => items,
        Reply::Error(e) => return Err(Error::Server(e)),
        other => {
            return Err(protocol_violation(
                connection,
                &exec,
                format!("unexpected EXEC reply: {other}"),
            ));
        }
    };
    if items.len() != queued.len() {
        return Err(protocol_violation(
            connection,
            &exec,
            format!("EXEC returned {} replies for {} commands", items.len(), queued.len()),
        ));
    }
    let mut values = Vec::with_capacity(items.len());
    for (command, item) in queued.iter().zip(items) {
        match item {
            Reply::Error(e) if exceptions => return Err(Error::Server(e)),
            Reply::Error(e) => values.push(Value::Error(Error::Server(e))),
            item => values.push(command.parse_response(item)),
        }
    }
    Ok(values)
}
