//! Pipelines.
//!
//! A [`Pipeline`] buffers commands and sends them in one batch. How the
//! replies are collected depends on the [`PipelineMode`]:
//!
//! - `Standard` writes everything, then reads every reply in order. An
//!   error reply fails the batch (and closes the connection, since later
//!   replies were not read) unless exceptions are off.
//! - `Safe` never fails. Failures are recorded inline, per node: once a
//!   node fails, every later command routed to it gets the same error.
//! - `FireAndForget` writes everything, reads nothing and disconnects.
//! - `Atomic` wraps the batch in `MULTI`/`EXEC`.

use crate::command::{Argument, Command, CommandTable, KeyPrefix, Value};
use crate::connection::{Aggregation, Connection};
use crate::error::{Error, Result};
use crate::protocol::Reply;
use crate::transaction::{aborted, expect_queued, parse_exec, protocol_violation};
use std::collections::HashMap;
use tracing::{debug, warn};

/// How a pipeline collects replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineMode {
    /// Write all, read all, fail on the first error reply
    #[default]
    Standard,
    /// Record every failure inline
    Safe,
    /// Write all, never read, then disconnect
    FireAndForget,
    /// Wrap the batch in `MULTI`/`EXEC`
    Atomic,
}

/// A batch of commands bound to a connection.
pub struct Pipeline<'a> {
    connection: &'a mut dyn Connection,
    table: &'a CommandTable,
    prefix: Option<&'a KeyPrefix>,
    mode: PipelineMode,
    exceptions: bool,
    commands: Vec<Command>,
}

impl<'a> Pipeline<'a> {
    /// Create an empty standard pipeline.
    pub fn new(
        connection: &'a mut dyn Connection,
        table: &'a CommandTable,
        prefix: Option<&'a KeyPrefix>,
    ) -> Self {
        Self {
            connection,
            table,
            prefix,
            mode: PipelineMode::Standard,
            exceptions: true,
            commands: Vec::new(),
        }
    }

    /// Builder: set the mode.
    pub fn mode(mut self, mode: PipelineMode) -> Self {
        self.mode = mode;
        self
    }

    /// Builder: raise error replies (standard and atomic modes).
    pub fn exceptions(mut self, enabled: bool) -> Self {
        self.exceptions = enabled;
        self
    }

    /// Number of buffered commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Returns true if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Buffer a command by id.
    pub fn call(&mut self, id: &str, arguments: Vec<Argument>) -> Result<()> {
        let command = self.table.create_prefixed(id, arguments, self.prefix)?;
        self.push(command);
        Ok(())
    }

    /// Buffer an already built command.
    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    /// Send the batch and collect the replies, one per command.
    ///
    /// Fire-and-forget pipelines return an empty list.
    pub fn execute(self) -> Result<Vec<Value>> {
        if self.commands.is_empty() {
            return Ok(Vec::new());
        }
        if self.connection.aggregation() == Aggregation::Replication {
            self.connection.switch_to_primary()?;
        }
        debug!(mode = ?self.mode, commands = self.commands.len(), "executing pipeline");
        if self.mode != PipelineMode::Safe {
            resolve_routes(self.connection, &self.commands)?;
        }
        match self.mode {
            PipelineMode::Standard => standard(self.connection, &self.commands, self.exceptions),
            PipelineMode::Safe => Ok(safe(self.connection, &self.commands)),
            PipelineMode::FireAndForget => {
                fire_and_forget(self.connection, &self.commands)?;
                Ok(Vec::new())
            }
            PipelineMode::Atomic => atomic(self.connection, &self.commands, self.exceptions),
        }
    }
}

impl std::fmt::Debug for Pipeline<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("mode", &self.mode)
            .field("exceptions", &self.exceptions)
            .field("commands", &self.commands.len())
            .finish()
    }
}

/// Route every command up front so nothing is written for a batch that
/// cannot be sent whole.
fn resolve_routes(connection: &mut dyn Connection, commands: &[Command]) -> Result<()> {
    for command in commands {
        connection.node_id(command)?;
    }
    Ok(())
}

/// Write the whole batch. A failure part way leaves unread replies on some
/// node, so every node is closed.
fn write_all(connection: &mut dyn Connection, commands: &[Command]) -> Result<()> {
    for (index, command) in commands.iter().enumerate() {
        if let Err(e) = connection.write_request(command) {
            warn!(index, error = %e, "pipeline write failed; disconnecting");
            connection.disconnect();
            return Err(e);
        }
    }
    Ok(())
}

fn standard(
    connection: &mut dyn Connection,
    commands: &[Command],
    exceptions: bool,
) -> Result<Vec<Value>> {
    write_all(connection, commands)?;
    let mut values = Vec::with_capacity(commands.len());
    for (index, command) in commands.iter().enumerate() {
        match connection.read_response(command)? {
            Reply::Error(e) if exceptions => {
                warn!(index, error = %e, "error reply in pipeline; disconnecting");
                connection.disconnect();
                return Err(Error::Server(e));
            }
            Reply::Error(e) => values.push(Value::Error(Error::Server(e))),
            reply => values.push(command.parse_response(reply)),
        }
    }
    Ok(values)
}

/// Per-node failure isolation: a failed node poisons its later commands.
fn safe(connection: &mut dyn Connection, commands: &[Command]) -> Vec<Value> {
    let mut failed: HashMap<String, Error> = HashMap::new();
    // node id per command, or the error that replaces its reply
    let mut routes: Vec<std::result::Result<String, Error>> = Vec::with_capacity(commands.len());

    for command in commands {
        let route = connection.node_id(command).and_then(|node| {
            if let Some(e) = failed.get(&node) {
                return Err(e.clone());
            }
            match connection.write_request(command) {
                Ok(()) => Ok(node),
                Err(e) => {
                    failed.insert(node, e.clone());
                    Err(e)
                }
            }
        });
        routes.push(route);
    }

    let mut values = Vec::with_capacity(commands.len());
    for (command, route) in commands.iter().zip(routes) {
        let node = match route {
            Ok(node) => node,
            Err(e) => {
                values.push(Value::Error(e));
                continue;
            }
        };
        if let Some(e) = failed.get(&node) {
            values.push(Value::Error(e.clone()));
            continue;
        }
        match connection.read_response(command) {
            Ok(Reply::Error(e)) => values.push(Value::Error(Error::Server(e))),
            Ok(reply) => values.push(command.parse_response(reply)),
            Err(e) => {
                warn!(node = %node, error = %e, "node failed during safe pipeline");
                failed.insert(node, e.clone());
                values.push(Value::Error(e));
            }
        }
    }
    values
}

fn fire_and_forget(connection: &mut dyn Connection, commands: &[Command]) -> Result<()> {
    write_all(connection, commands)?;
    connection.disconnect();
    Ok(())
}

fn atomic(
    connection: &mut dyn Connection,
    commands: &[Command],
    exceptions: bool,
) -> Result<Vec<Value>> {
    let aggregation = connection.aggregation();
    if matches!(aggregation, Aggregation::Cluster | Aggregation::Sharded) {
        return Err(Error::Routing(format!(
            "Cannot use an atomic pipeline over {}",
            aggregation.describe()
        )));
    }

    let multi = Command::raw("MULTI", Vec::new());
    let reply = connection.execute_command(&multi)?;
    match reply {
        Reply::Ok => {}
        Reply::Error(e) => return Err(Error::Server(e)),
        other => {
            return Err(protocol_violation(
                connection,
                &multi,
                format!("expected OK for 'MULTI', got {other}"),
            ));
        }
    }

    write_all(connection, commands)?;
    let mut first_error = None;
    for command in commands {
        let reply = connection.read_response(command)?;
        match reply {
            Reply::Error(e) => {
                // keep reading so the stream stays in sync
                first_error.get_or_insert(e);
            }
            reply => expect_queued(connection, command, reply)?,
        }
    }
    if let Some(e) = first_error {
        let discard = Command::raw("DISCARD", Vec::new());
        connection.execute_command(&discard)?;
        return Err(Error::Server(e));
    }

    let exec = Command::raw("EXEC", Vec::new());
    match connection.execute_command(&exec)? {
        Reply::Nil => Err(aborted()),
        reply => parse_exec(connection, commands, reply, exceptions),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::mock::{always_ok, scripted, Log, MockConnection, Responder};
    use crate::connection::ConnectionParameters;
    use std::sync::Arc;

    fn node(responder: Responder, log: &Log) -> MockConnection {
        MockConnection::new("127.0.0.1:6379", responder, log.clone())
    }

    fn fill(pipeline: &mut Pipeline<'_>) {
        pipeline.call("SET", vec!["a".into(), "1".into()]).unwrap();
        pipeline.call("GET", vec!["a".into()]).unwrap();
        pipeline.call("EXISTS", vec!["a".into()]).unwrap();
    }

    #[test]
    fn test_standard_pipeline() {
        let log = Log::default();
        let mut conn = node(
            scripted(vec![Ok(Reply::Ok), Ok(Reply::bulk("1")), Ok(Reply::Integer(1))]),
            &log,
        );
        let table = CommandTable::new();
        let mut pipeline = Pipeline::new(&mut conn, &table, None);
        fill(&mut pipeline);
        let values = pipeline.execute().unwrap();
        assert_eq!(
            values,
            vec![Value::Okay, Value::Data("1".into()), Value::Bool(true)]
        );
        assert_eq!(log.entries().len(), 3);
    }

    #[test]
    fn test_standard_error_reply() {
        let replies = || {
            vec![
                Ok(Reply::Ok),
                Ok(Reply::error("WRONGTYPE nope")),
                Ok(Reply::Integer(1)),
            ]
        };
        let table = CommandTable::new();
        let log = Log::default();

        let mut conn = node(scripted(replies()), &log);
        let mut pipeline = Pipeline::new(&mut conn, &table, None);
        fill(&mut pipeline);
        assert!(matches!(pipeline.execute(), Err(Error::Server(_))));
        assert!(!conn.is_connected());

        let mut conn = node(scripted(replies()), &log);
        let mut pipeline = Pipeline::new(&mut conn, &table, None).exceptions(false);
        fill(&mut pipeline);
        let values = pipeline.execute().unwrap();
        assert!(values[1].is_error());
        assert_eq!(values[2], Value::Bool(true));
    }

    #[test]
    fn test_safe_pipeline_records_failure_for_rest() {
        let log = Log::default();
        let mut conn = node(
            scripted(vec![
                Ok(Reply::Ok),
                Err(Error::connection("127.0.0.1:6379", "connection reset")),
            ]),
            &log,
        );
        let table = CommandTable::new();
        let mut pipeline = Pipeline::new(&mut conn, &table, None).mode(PipelineMode::Safe);
        fill(&mut pipeline);
        let values = pipeline.execute().unwrap();
        assert_eq!(values[0], Value::Okay);
        let reset = Value::Error(Error::connection("127.0.0.1:6379", "connection reset"));
        assert_eq!(values[1], reset);
        assert_eq!(values[2], reset);
    }

    #[test]
    fn test_safe_pipeline_isolates_nodes() {
        use crate::cluster::ShardedCluster;
        use crate::config::RingAlgorithm;

        let log = Log::default();
        let responder: Responder = Arc::new(|endpoint: &str, _: &Command| {
            if endpoint == "10.0.0.1:6379" {
                Err(Error::connection(endpoint, "down"))
            } else {
                Ok(Reply::Ok)
            }
        });
        let mut cluster = ShardedCluster::new(RingAlgorithm::Crc32);
        for endpoint in ["10.0.0.1:6379", "10.0.0.2:6379"] {
            let params = ConnectionParameters::parse(endpoint).unwrap();
            cluster.add(Box::new(MockConnection::with_parameters(
                params,
                Arc::clone(&responder),
                log.clone(),
            )));
        }

        // find keys owned by each node
        let key_on = |owner: &str| {
            (0..1000)
                .map(|i| format!("k{i}"))
                .find(|k| cluster.distributor().get(k.as_bytes()).as_deref() == Some(owner))
                .unwrap()
        };
        let down = key_on("10.0.0.1:6379");
        let up = key_on("10.0.0.2:6379");

        let table = CommandTable::new();
        let mut pipeline = Pipeline::new(&mut cluster, &table, None).mode(PipelineMode::Safe);
        pipeline.call("SET", vec![down.as_str().into(), "1".into()]).unwrap();
        pipeline.call("SET", vec![up.as_str().into(), "1".into()]).unwrap();
        pipeline.call("GET", vec![down.as_str().into()]).unwrap();
        pipeline.call("MGET", vec!["a{x}".into(), "b{y}".into()]).unwrap();
        let values = pipeline.execute().unwrap();

        assert!(values[0].is_error());
        assert_eq!(values[1], Value::Okay);
        assert!(values[2].is_error());
        assert!(matches!(values[3], Value::Error(Error::Routing(_))));
    }

    #[test]
    fn test_fire_and_forget_disconnects() {
        let log = Log::default();
        let mut conn = node(always_ok(), &log);
        let table = CommandTable::new();
        let mut pipeline =
            Pipeline::new(&mut conn, &table, None).mode(PipelineMode::FireAndForget);
        fill(&mut pipeline);
        assert!(pipeline.execute().unwrap().is_empty());
        assert_eq!(log.entries().len(), 3);
        assert!(!conn.is_connected());
    }

    #[test]
    fn test_atomic_pipeline() {
        let log = Log::default();
        let mut conn = node(
            scripted(vec![
                Ok(Reply::Ok),
                Ok(Reply::Queued),
                Ok(Reply::Queued),
                Ok(Reply::Queued),
                Ok(Reply::Array(vec![Reply::Ok, Reply::bulk("1"), Reply::Integer(0)])),
            ]),
            &log,
        );
        let table = CommandTable::new();
        let mut pipeline = Pipeline::new(&mut conn, &table, None).mode(PipelineMode::Atomic);
        fill(&mut pipeline);
        let values = pipeline.execute().unwrap();
        assert_eq!(
            values,
            vec![Value::Okay, Value::Data("1".into()), Value::Bool(false)]
        );
        let ids: Vec<String> = log
            .entries()
            .iter()
            .map(|e| e.split(' ').nth(1).unwrap().to_string())
            .collect();
        assert_eq!(ids, ["MULTI", "SET", "GET", "EXISTS", "EXEC"]);
    }

    #[test]
    fn test_atomic_unexpected_ack() {
        let log = Log::default();
        let mut conn = node(
            scripted(vec![
                Ok(Reply::Ok),
                Ok(Reply::Queued),
                Ok(Reply::Integer(3)),
            ]),
            &log,
        );
        let table = CommandTable::new();
        let mut pipeline = Pipeline::new(&mut conn, &table, None).mode(PipelineMode::Atomic);
        fill(&mut pipeline);
        assert!(matches!(pipeline.execute(), Err(Error::Protocol { .. })));
        assert!(!conn.is_connected());
    }

    #[test]
    fn test_atomic_error_ack_discards() {
        let log = Log::default();
        let mut conn = node(
            scripted(vec![
                Ok(Reply::Ok),
                Ok(Reply::Queued),
                Ok(Reply::error("ERR wrong number of arguments")),
                Ok(Reply::Queued),
                Ok(Reply::Ok),
            ]),
            &log,
        );
        let table = CommandTable::new();
        let mut pipeline = Pipeline::new(&mut conn, &table, None).mode(PipelineMode::Atomic);
        fill(&mut pipeline);
        assert!(matches!(pipeline.execute(), Err(Error::Server(_))));
        assert!(log.entries().last().unwrap().ends_with("DISCARD"));
    }

    #[test]
    fn test_atomic_aborted() {
        let log = Log::default();
        let mut conn = node(
            scripted(vec![Ok(Reply::Ok), Ok(Reply::Queued), Ok(Reply::Nil)]),
            &log,
        );
        let table = CommandTable::new();
        let mut pipeline = Pipeline::new(&mut conn, &table, None).mode(PipelineMode::Atomic);
        pipeline.call("INCR", vec!["k".into()]).unwrap();
        assert!(matches!(pipeline.execute(), Err(Error::Aborted(_))));
    }

    #[test]
    fn test_atomic_rejects_clusters() {
        let mut cluster =
            crate::cluster::ShardedCluster::new(crate::config::RingAlgorithm::Crc32);
        let table = CommandTable::new();
        let mut pipeline = Pipeline::new(&mut cluster, &table, None).mode(PipelineMode::Atomic);
        pipeline.call("GET", vec!["k".into()]).unwrap();
        assert!(matches!(pipeline.execute(), Err(Error::Routing(_))));
    }

    /// Replies with the first argument, so a reply always names its request.
    fn echo() -> Responder {
        Arc::new(|_: &str, command: &Command| {
            Ok(match command.argument(0) {
                Some(first) => Reply::Bulk(first.clone()),
                None => Reply::Ok,
            })
        })
    }

    fn sharded_echo(log: &Log) -> crate::cluster::ShardedCluster {
        let mut cluster =
            crate::cluster::ShardedCluster::new(crate::config::RingAlgorithm::Crc32);
        cluster.add(MockConnection::boxed("10.0.0.1:6379", echo(), log.clone()));
        cluster
    }

    #[test]
    fn test_cross_slot_command_fails_batch_before_writing() {
        let table = CommandTable::new();
        for mode in [PipelineMode::Standard, PipelineMode::FireAndForget] {
            let log = Log::default();
            let mut cluster = sharded_echo(&log);
            let mut pipeline = Pipeline::new(&mut cluster, &table, None).mode(mode);
            pipeline.call("GET", vec!["first".into()]).unwrap();
            pipeline.call("MGET", vec!["a{x}".into(), "b{y}".into()]).unwrap();
            assert!(matches!(pipeline.execute(), Err(Error::Routing(_))), "{mode:?}");
            assert!(log.entries().is_empty(), "{mode:?}");

            let get = table.create("GET", vec!["second".into()]).unwrap();
            assert_eq!(cluster.execute_command(&get).unwrap(), Reply::bulk("second"));
        }
    }

    #[test]
    fn test_admin_command_fails_atomic_batch_before_multi() {
        use crate::replication::Replication;

        let log = Log::default();
        let mut replication = Replication::new();
        replication.add(MockConnection::boxed(
            "tcp://10.0.0.1:6379?role=master",
            echo(),
            log.clone(),
        ));
        replication.add(MockConnection::boxed("10.0.0.2:6379", echo(), log.clone()));

        let table = CommandTable::new();
        for mode in [PipelineMode::Standard, PipelineMode::Atomic] {
            let mut pipeline = Pipeline::new(&mut replication, &table, None).mode(mode);
            pipeline.call("SET", vec!["k".into(), "v".into()]).unwrap();
            pipeline.call("INFO", Vec::new()).unwrap();
            assert!(matches!(pipeline.execute(), Err(Error::Routing(_))), "{mode:?}");
        }
        assert!(log.entries().is_empty());

        let set = table.create("SET", vec!["next".into(), "v".into()]).unwrap();
        assert_eq!(replication.execute_command(&set).unwrap(), Reply::bulk("next"));
        assert_eq!(log.entries(), ["10.0.0.1:6379 SET next v"]);
    }

    #[test]
    fn test_empty_pipeline_sends_nothing() {
        let log = Log::default();
        let mut conn = node(always_ok(), &log);
        let table = CommandTable::new();
        let pipeline = Pipeline::new(&mut conn, &table, None).mode(PipelineMode::Atomic);
        assert!(pipeline.execute().unwrap().is_empty());
        assert!(log.entries().is_empty());
    }
}
