//! Client facade.
//!
//! A [`Client`] owns one connection (a single node or one of the routing
//! aggregates, chosen by [`Mode`]), the command table and the key prefix.
//! The [`Commands`] trait gives the client, pipelines and transactions the
//! same typed command surface.

use crate::cluster::{RedisCluster, ShardedCluster};
use crate::command::{Argument, Command, CommandTable, KeyPrefix, Value};
use crate::config::{Config, Mode};
use crate::connection::{Connection, ConnectionFactory, Role, StreamFactory};
use crate::error::{Error, Result};
use crate::pipeline::{Pipeline, PipelineMode};
use crate::protocol::Reply;
use crate::replication::Replication;
use crate::transaction::{Transaction, TransactionOptions};
use std::sync::Arc;
use tracing::debug;

/// Typed command surface shared by [`Client`], [`Pipeline`] and
/// [`Transaction`].
///
/// Every method builds a command through the command table and hands it
/// to [`Commands::call`], so what `Output` means depends on the
/// implementor: a value for the client, `()` for a pipeline.
pub trait Commands {
    /// Result of one call.
    type Output;

    /// Build and dispatch a command by id.
    fn call(&mut self, id: &str, arguments: Vec<Argument>) -> Self::Output;

    /// `PING`
    fn ping(&mut self) -> Self::Output {
        self.call("PING", Vec::new())
    }

    /// `GET key`
    fn get<K: Into<Argument>>(&mut self, key: K) -> Self::Output {
        self.call("GET", vec![key.into()])
    }

    /// `SET key value`
    fn set<K: Into<Argument>, V: Into<Argument>>(&mut self, key: K, value: V) -> Self::Output {
        self.call("SET", vec![key.into(), value.into()])
    }

    /// `SET key value EX seconds`
    fn set_ex<K: Into<Argument>, V: Into<Argument>>(
        &mut self,
        key: K,
        value: V,
        seconds: u64,
    ) -> Self::Output {
        self.call("SET", vec![key.into(), value.into(), "EX".into(), seconds.into()])
    }

    /// `MGET key [key ...]`
    fn mget<I, K>(&mut self, keys: I) -> Self::Output
    where
        I: IntoIterator<Item = K>,
        K: Into<Argument>,
    {
        self.call("MGET", collect(keys))
    }

    /// `INCR key`
    fn incr<K: Into<Argument>>(&mut self, key: K) -> Self::Output {
        self.call("INCR", vec![key.into()])
    }

    /// `INCRBY key delta`
    fn incr_by<K: Into<Argument>>(&mut self, key: K, delta: i64) -> Self::Output {
        self.call("INCRBY", vec![key.into(), delta.into()])
    }

    /// `DECR key`
    fn decr<K: Into<Argument>>(&mut self, key: K) -> Self::Output {
        self.call("DECR", vec![key.into()])
    }

    /// `DEL key [key ...]`
    fn del<I, K>(&mut self, keys: I) -> Self::Output
    where
        I: IntoIterator<Item = K>,
        K: Into<Argument>,
    {
        self.call("DEL", collect(keys))
    }

    /// `EXISTS key`
    fn exists<K: Into<Argument>>(&mut self, key: K) -> Self::Output {
        self.call("EXISTS", vec![key.into()])
    }

    /// `EXPIRE key seconds`
    fn expire<K: Into<Argument>>(&mut self, key: K, seconds: i64) -> Self::Output {
        self.call("EXPIRE", vec![key.into(), seconds.into()])
    }

    /// `TTL key`
    fn ttl<K: Into<Argument>>(&mut self, key: K) -> Self::Output {
        self.call("TTL", vec![key.into()])
    }

    /// `LPUSH key value [value ...]`
    fn lpush<K, I, V>(&mut self, key: K, values: I) -> Self::Output
    where
        K: Into<Argument>,
        I: IntoIterator<Item = V>,
        V: Into<Argument>,
    {
        self.call("LPUSH", keyed(key, values))
    }

    /// `RPUSH key value [value ...]`
    fn rpush<K, I, V>(&mut self, key: K, values: I) -> Self::Output
    where
        K: Into<Argument>,
        I: IntoIterator<Item = V>,
        V: Into<Argument>,
    {
        self.call("RPUSH", keyed(key, values))
    }

    /// `LPOP key`
    fn lpop<K: Into<Argument>>(&mut self, key: K) -> Self::Output {
        self.call("LPOP", vec![key.into()])
    }

    /// `RPOP key`
    fn rpop<K: Into<Argument>>(&mut self, key: K) -> Self::Output {
        self.call("RPOP", vec![key.into()])
    }

    /// `LRANGE key start stop`
    fn lrange<K: Into<Argument>>(&mut self, key: K, start: i64, stop: i64) -> Self::Output {
        self.call("LRANGE", vec![key.into(), start.into(), stop.into()])
    }

    /// `LLEN key`
    fn llen<K: Into<Argument>>(&mut self, key: K) -> Self::Output {
        self.call("LLEN", vec![key.into()])
    }

    /// `SADD key member [member ...]`
    fn sadd<K, I, M>(&mut self, key: K, members: I) -> Self::Output
    where
        K: Into<Argument>,
        I: IntoIterator<Item = M>,
        M: Into<Argument>,
    {
        self.call("SADD", keyed(key, members))
    }

    /// `SREM key member [member ...]`
    fn srem<K, I, M>(&mut self, key: K, members: I) -> Self::Output
    where
        K: Into<Argument>,
        I: IntoIterator<Item = M>,
        M: Into<Argument>,
    {
        self.call("SREM", keyed(key, members))
    }

    /// `SISMEMBER key member`
    fn sismember<K: Into<Argument>, M: Into<Argument>>(&mut self, key: K, member: M) -> Self::Output {
        self.call("SISMEMBER", vec![key.into(), member.into()])
    }

    /// `SMEMBERS key`
    fn smembers<K: Into<Argument>>(&mut self, key: K) -> Self::Output {
        self.call("SMEMBERS", vec![key.into()])
    }

    /// `SCARD key`
    fn scard<K: Into<Argument>>(&mut self, key: K) -> Self::Output {
        self.call("SCARD", vec![key.into()])
    }

    /// `HSET key field value`
    fn hset<K, F, V>(&mut self, key: K, field: F, value: V) -> Self::Output
    where
        K: Into<Argument>,
        F: Into<Argument>,
        V: Into<Argument>,
    {
        self.call("HSET", vec![key.into(), field.into(), value.into()])
    }

    /// `HGET key field`
    fn hget<K: Into<Argument>, F: Into<Argument>>(&mut self, key: K, field: F) -> Self::Output {
        self.call("HGET", vec![key.into(), field.into()])
    }

    /// `HDEL key field [field ...]`
    fn hdel<K, I, F>(&mut self, key: K, fields: I) -> Self::Output
    where
        K: Into<Argument>,
        I: IntoIterator<Item = F>,
        F: Into<Argument>,
    {
        self.call("HDEL", keyed(key, fields))
    }

    /// `HGETALL key`, folded into a map
    fn hgetall<K: Into<Argument>>(&mut self, key: K) -> Self::Output {
        self.call("HGETALL", vec![key.into()])
    }
}

fn collect<I, K>(items: I) -> Vec<Argument>
where
    I: IntoIterator<Item = K>,
    K: Into<Argument>,
{
    items.into_iter().map(Into::into).collect()
}

fn keyed<K, I, V>(key: K, items: I) -> Vec<Argument>
where
    K: Into<Argument>,
    I: IntoIterator<Item = V>,
    V: Into<Argument>,
{
    let mut arguments = vec![key.into()];
    arguments.extend(items.into_iter().map(Into::into));
    arguments
}

/// A client bound to one connection.
pub struct Client {
    connection: Box<dyn Connection>,
    table: CommandTable,
    prefix: Option<KeyPrefix>,
    config: Config,
}

impl Client {
    /// Create a client over sockets.
    ///
    /// Nothing is connected until the first command.
    pub fn new(config: Config) -> Result<Self> {
        Self::from_factory(config, Arc::new(StreamFactory::new()))
    }

    /// Create a client whose node connections come from `factory`.
    pub fn from_factory(config: Config, factory: Arc<dyn ConnectionFactory>) -> Result<Self> {
        let connection = build_connection(&config, factory)?;
        Ok(Self::with_connection(connection, config))
    }

    /// Wrap an existing connection.
    pub fn with_connection(connection: Box<dyn Connection>, config: Config) -> Self {
        let prefix = config.prefix.clone().map(KeyPrefix::from);
        Self {
            connection,
            table: CommandTable::new(),
            prefix,
            config,
        }
    }

    /// Options the client was built with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The command table.
    pub fn table(&self) -> &CommandTable {
        &self.table
    }

    /// The command table, for registering or overriding commands.
    pub fn table_mut(&mut self) -> &mut CommandTable {
        &mut self.table
    }

    /// The key prefix, if any.
    pub fn prefix(&self) -> Option<&KeyPrefix> {
        self.prefix.as_ref()
    }

    /// The underlying connection.
    pub fn connection_mut(&mut self) -> &mut dyn Connection {
        &mut *self.connection
    }

    /// Open the connection eagerly.
    pub fn connect(&mut self) -> Result<()> {
        self.connection.connect()
    }

    /// Close the connection.
    pub fn disconnect(&mut self) {
        self.connection.disconnect();
    }

    /// Returns true if a transport is open.
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Build a command through the table, applying the key prefix.
    pub fn create_command(&self, id: &str, arguments: Vec<Argument>) -> Result<Command> {
        self.table.create_prefixed(id, arguments, self.prefix.as_ref())
    }

    /// Execute a command and post-process its reply.
    ///
    /// Server error replies are returned as `Err` when exceptions are on,
    /// or as [`Value::Error`] otherwise.
    pub fn execute(&mut self, command: Command) -> Result<Value> {
        match self.connection.execute_command(&command)? {
            Reply::Error(e) if self.config.exceptions => Err(Error::Server(e)),
            Reply::Error(e) => Ok(Value::Error(Error::Server(e))),
            reply => Ok(command.parse_response(reply)),
        }
    }

    /// Start a standard pipeline.
    pub fn pipeline(&mut self) -> Pipeline<'_> {
        self.pipeline_with(PipelineMode::Standard)
    }

    /// Start a pipeline in the given mode.
    pub fn pipeline_with(&mut self, mode: PipelineMode) -> Pipeline<'_> {
        Pipeline::new(&mut *self.connection, &self.table, self.prefix.as_ref())
            .mode(mode)
            .exceptions(self.config.exceptions)
    }

    /// Start a transaction.
    pub fn transaction(&mut self, options: TransactionOptions) -> Result<Transaction<'_>> {
        Transaction::new(
            &mut *self.connection,
            &self.table,
            self.prefix.as_ref(),
            options,
        )
    }

    /// Run `block` in a transaction and commit it.
    ///
    /// Returns `None` when the block discarded the transaction.
    pub fn multi_exec<F>(
        &mut self,
        options: TransactionOptions,
        block: F,
    ) -> Result<Option<Vec<Value>>>
    where
        F: FnMut(&mut Transaction<'_>) -> Result<()>,
    {
        self.transaction(options)?.execute(block)
    }
}

impl Commands for Client {
    type Output = Result<Value>;

    fn call(&mut self, id: &str, arguments: Vec<Argument>) -> Result<Value> {
        let command = self.create_command(id, arguments)?;
        self.execute(command)
    }
}

impl Commands for Pipeline<'_> {
    type Output = Result<()>;

    fn call(&mut self, id: &str, arguments: Vec<Argument>) -> Result<()> {
        Pipeline::call(self, id, arguments)
    }
}

impl Commands for Transaction<'_> {
    type Output = Result<Value>;

    fn call(&mut self, id: &str, arguments: Vec<Argument>) -> Result<Value> {
        Transaction::call(self, id, arguments)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("mode", &self.config.mode)
            .field("aggregation", &self.connection.aggregation())
            .field("prefix", &self.prefix)
            .finish()
    }
}

fn build_connection(
    config: &Config,
    factory: Arc<dyn ConnectionFactory>,
) -> Result<Box<dyn Connection>> {
    let defaults = config.default_parameters();
    let mut nodes = config.resolved_nodes();
    debug!(mode = ?config.mode, nodes = nodes.len(), "building connection");

    let connection: Box<dyn Connection> = match config.mode {
        Mode::Single => {
            let params = if nodes.is_empty() {
                defaults
            } else {
                nodes.swap_remove(0)
            };
            Box::new(factory.create(params)?)
        }
        Mode::Sharded => {
            let mut cluster = ShardedCluster::new(config.ring);
            for params in nodes {
                cluster.add(factory.create(params)?);
            }
            Box::new(cluster)
        }
        Mode::Cluster => {
            let mut cluster = RedisCluster::new(Arc::clone(&factory), defaults)
                .use_cluster_slots(config.cluster_slots);
            for params in nodes {
                cluster.add(factory.create(params)?);
            }
            Box::new(cluster)
        }
        Mode::Replication => {
            // without an explicit primary the first node takes the role
            if !nodes
                .iter()
                .any(|p| p.role == Some(Role::Primary) || p.alias.as_deref() == Some("master"))
            {
                if let Some(first) = nodes.first_mut() {
                    first.role = Some(Role::Primary);
                }
            }
            let mut replication = Replication::new()
                .stick_to_primary(config.stick_to_primary)
                .with_factory(Arc::clone(&factory), defaults);
            for params in nodes {
                replication.add(factory.create(params)?);
            }
            if config.autodiscovery {
                replication.discover()?;
            }
            Box::new(replication)
        }
    };
    Ok(connection)
}
