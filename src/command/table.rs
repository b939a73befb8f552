//! Command table for looking up how a command is built, routed and decoded.

use super::keys::KeyLayout;
use super::normalize::{self, Normalizer};
use super::response::{self, ResponseParser};
use super::{Argument, Command, KeyPrefix};
use crate::error::{Error, Result};
use std::collections::HashMap;

bitflags::bitflags! {
    /// Command flags consulted by the routing layers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CommandFlags: u8 {
        /// Command never modifies data
        const READONLY    = 1 << 0;
        /// Command modifies data
        const WRITE       = 1 << 1;
        /// Server administration; refused in replication mode
        const ADMIN       = 1 << 2;
        /// Command may block the connection
        const BLOCKING    = 1 << 3;
        /// Script execution (`EVAL`, `EVALSHA`)
        const SCRIPTING   = 1 << 4;
        /// Transaction control (`MULTI`, `EXEC`, `WATCH`, ...)
        const TRANSACTION = 1 << 5;
    }
}

/// How one command is built, routed and decoded.
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    /// Routing flags
    pub flags: CommandFlags,
    /// Where the keys are
    pub keys: KeyLayout,
    /// Structured arguments to wire arguments
    pub normalize: Normalizer,
    /// Raw reply to caller value
    pub response: ResponseParser,
}

impl CommandSpec {
    /// A spec with the given flags and key layout.
    pub fn new(flags: CommandFlags, keys: KeyLayout) -> Self {
        Self {
            flags,
            keys,
            normalize: normalize::flatten,
            response: response::identity,
        }
    }

    /// A read-only command.
    pub fn read(keys: KeyLayout) -> Self {
        Self::new(CommandFlags::READONLY, keys)
    }

    /// A command that modifies data.
    pub fn write(keys: KeyLayout) -> Self {
        Self::new(CommandFlags::WRITE, keys)
    }

    /// An administrative command without keys.
    pub fn admin() -> Self {
        Self::new(CommandFlags::ADMIN, KeyLayout::None)
    }

    /// Spec used for ids missing from the table: no keys, write semantics.
    pub fn generic() -> Self {
        Self::write(KeyLayout::None)
    }

    /// Replace the response parser.
    pub fn with_response(mut self, response: ResponseParser) -> Self {
        self.response = response;
        self
    }

    /// Replace the argument normalizer.
    pub fn with_normalizer(mut self, normalize: Normalizer) -> Self {
        self.normalize = normalize;
        self
    }

    /// Add flags.
    pub fn with_flags(mut self, flags: CommandFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Returns true if the command never modifies data.
    #[inline]
    pub fn is_readonly(&self) -> bool {
        self.flags.contains(CommandFlags::READONLY)
    }
}

impl Default for CommandSpec {
    fn default() -> Self {
        Self::generic()
    }
}

/// Registry of known commands keyed by upper-case id.
///
/// [`CommandTable::create_raw`] still accepts unknown ids and gives them
/// [`CommandSpec::generic`]: no keys, no response post-processing.
#[derive(Debug, Clone, Default)]
pub struct CommandTable {
    commands: HashMap<String, CommandSpec>,
}

impl CommandTable {
    /// Create a table with all built-in commands.
    pub fn new() -> Self {
        let mut table = Self::empty();
        table.register_all();
        table
    }

    /// Create a table with no commands.
    pub fn empty() -> Self {
        Self {
            commands: HashMap::new(),
        }
    }

    /// Register (or replace) a command.
    pub fn register(&mut self, id: &str, spec: CommandSpec) {
        self.commands.insert(id.to_ascii_uppercase(), spec);
    }

    /// Look up a command by id.
    pub fn get(&self, id: &str) -> Option<&CommandSpec> {
        self.commands.get(&id.to_ascii_uppercase())
    }

    /// Returns true if `id` is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Spec for `id`, falling back to [`CommandSpec::generic`].
    pub fn spec(&self, id: &str) -> CommandSpec {
        self.get(id).copied().unwrap_or_else(CommandSpec::generic)
    }

    /// Build a command from structured arguments.
    ///
    /// Unknown ids are rejected; use [`CommandTable::create_raw`] to send
    /// them anyway.
    pub fn create(&self, id: &str, arguments: Vec<Argument>) -> Result<Command> {
        let spec = self
            .get(id)
            .copied()
            .ok_or_else(|| {
                Error::Client(format!("command '{}' is not registered", id.to_ascii_uppercase()))
            })?;
        Ok(Command::new(id, spec, arguments))
    }

    /// Like [`CommandTable::create`], then apply `prefix` to the keys.
    pub fn create_prefixed(
        &self,
        id: &str,
        arguments: Vec<Argument>,
        prefix: Option<&KeyPrefix>,
    ) -> Result<Command> {
        let mut command = self.create(id, arguments)?;
        if let Some(prefix) = prefix {
            prefix.apply(&mut command);
        }
        Ok(command)
    }

    /// Build a command from wire arguments, skipping normalization.
    pub fn create_raw(&self, id: &str, arguments: Vec<bytes::Bytes>) -> Command {
        Command::from_raw(id, self.spec(id), arguments)
    }

    /// Iterate registered ids and specs.
    pub fn commands(&self) -> impl Iterator<Item = (&str, &CommandSpec)> {
        self.commands.iter().map(|(id, spec)| (id.as_str(), spec))
    }

    /// Get command count.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    fn register_all(&mut self) {
        self.register_string_commands();
        self.register_key_commands();
        self.register_list_commands();
        self.register_set_commands();
        self.register_sorted_set_commands();
        self.register_hash_commands();
        self.register_hyperloglog_commands();
        self.register_geo_commands();
        self.register_scripting_commands();
        self.register_transaction_commands();
        self.register_connection_commands();
        self.register_server_commands();
    }

    fn register_many(&mut self, ids: &[&str], spec: CommandSpec) {
        for id in ids {
            self.register(id, spec);
        }
    }

    fn register_string_commands(&mut self) {
        use KeyLayout::*;
        self.register_many(
            &["GET", "STRLEN", "GETRANGE", "SUBSTR", "GETBIT", "BITCOUNT", "BITPOS"],
            CommandSpec::read(First),
        );
        self.register("MGET", CommandSpec::read(All));
        self.register_many(
            &[
                "SET", "SETEX", "PSETEX", "GETSET", "GETDEL", "INCR", "INCRBY", "INCRBYFLOAT",
                "DECR", "DECRBY", "APPEND", "SETRANGE", "SETBIT",
            ],
            CommandSpec::write(First),
        );
        self.register("SETNX", CommandSpec::write(First).with_response(response::boolean));
        self.register("MSET", CommandSpec::write(Interleaved));
        self.register(
            "MSETNX",
            CommandSpec::write(Interleaved).with_response(response::boolean),
        );
        self.register("BITOP", CommandSpec::write(SkipFirst));
        // read-only unless it carries SET/INCRBY; see the replication strategy
        self.register("BITFIELD", CommandSpec::write(First));
    }

    fn register_key_commands(&mut self) {
        use KeyLayout::*;
        self.register_many(&["DEL", "UNLINK", "TOUCH"], CommandSpec::write(All));
        self.register("EXISTS", CommandSpec::read(All).with_response(response::exists));
        self.register_many(
            &["EXPIRE", "PEXPIRE", "EXPIREAT", "PEXPIREAT", "PERSIST", "MOVE"],
            CommandSpec::write(First).with_response(response::boolean),
        );
        self.register_many(&["TTL", "PTTL", "TYPE", "DUMP"], CommandSpec::read(First));
        self.register_many(&["KEYS", "RANDOMKEY"], CommandSpec::read(None));
        self.register("SCAN", CommandSpec::read(None).with_response(response::scan));
        self.register("RENAME", CommandSpec::write(All));
        self.register("RENAMENX", CommandSpec::write(All).with_response(response::boolean));
        self.register("RESTORE", CommandSpec::write(First));
        self.register("SORT", CommandSpec::write(Sort));
    }

    fn register_list_commands(&mut self) {
        use KeyLayout::*;
        self.register_many(&["LLEN", "LRANGE", "LINDEX"], CommandSpec::read(First));
        self.register_many(
            &[
                "LPUSH", "RPUSH", "LPUSHX", "RPUSHX", "LPOP", "RPOP", "LSET", "LREM", "LTRIM",
                "LINSERT",
            ],
            CommandSpec::write(First),
        );
        self.register("RPOPLPUSH", CommandSpec::write(All));
        self.register_many(
            &["BLPOP", "BRPOP", "BRPOPLPUSH"],
            CommandSpec::write(SkipLast).with_flags(CommandFlags::BLOCKING),
        );
    }

    fn register_set_commands(&mut self) {
        use KeyLayout::*;
        self.register_many(&["SCARD", "SMEMBERS", "SRANDMEMBER"], CommandSpec::read(First));
        self.register("SISMEMBER", CommandSpec::read(First).with_response(response::boolean));
        self.register_many(&["SADD", "SREM", "SPOP"], CommandSpec::write(First));
        self.register("SMOVE", CommandSpec::write(SkipLast).with_response(response::boolean));
        self.register_many(&["SINTER", "SUNION", "SDIFF"], CommandSpec::read(All));
        self.register_many(
            &["SINTERSTORE", "SUNIONSTORE", "SDIFFSTORE"],
            CommandSpec::write(All),
        );
        self.register("SSCAN", CommandSpec::read(First).with_response(response::scan));
    }

    fn register_sorted_set_commands(&mut self) {
        use KeyLayout::*;
        self.register_many(
            &["ZCARD", "ZSCORE", "ZCOUNT", "ZRANK", "ZREVRANK", "ZLEXCOUNT", "ZRANGEBYLEX"],
            CommandSpec::read(First),
        );
        self.register_many(
            &["ZRANGE", "ZREVRANGE", "ZRANGEBYSCORE", "ZREVRANGEBYSCORE"],
            CommandSpec::read(First).with_response(response::with_scores),
        );
        self.register("ZADD", CommandSpec::write(First).with_normalizer(normalize::zset_add));
        self.register_many(
            &["ZREM", "ZINCRBY", "ZREMRANGEBYRANK", "ZREMRANGEBYSCORE", "ZREMRANGEBYLEX"],
            CommandSpec::write(First),
        );
        self.register_many(
            &["ZINTERSTORE", "ZUNIONSTORE"],
            CommandSpec::write(ZsetStore).with_normalizer(normalize::zset_store),
        );
        self.register("ZSCAN", CommandSpec::read(First).with_response(response::scan_pairs));
    }

    fn register_hash_commands(&mut self) {
        use KeyLayout::*;
        self.register_many(
            &["HGET", "HMGET", "HLEN", "HKEYS", "HVALS", "HSTRLEN"],
            CommandSpec::read(First),
        );
        self.register("HGETALL", CommandSpec::read(First).with_response(response::pairs));
        self.register("HEXISTS", CommandSpec::read(First).with_response(response::boolean));
        self.register_many(
            &["HSET", "HMSET", "HDEL", "HINCRBY", "HINCRBYFLOAT"],
            CommandSpec::write(First),
        );
        self.register("HSETNX", CommandSpec::write(First).with_response(response::boolean));
        self.register("HSCAN", CommandSpec::read(First).with_response(response::scan_pairs));
    }

    fn register_hyperloglog_commands(&mut self) {
        use KeyLayout::*;
        self.register("PFADD", CommandSpec::write(First).with_response(response::boolean));
        self.register("PFCOUNT", CommandSpec::read(All));
        self.register("PFMERGE", CommandSpec::write(All));
    }

    fn register_geo_commands(&mut self) {
        use KeyLayout::*;
        self.register_many(&["GEOHASH", "GEOPOS", "GEODIST"], CommandSpec::read(First));
        self.register("GEOADD", CommandSpec::write(First));
        // read-only unless it carries STORE/STOREDIST; see the replication strategy
        self.register_many(&["GEORADIUS", "GEORADIUSBYMEMBER"], CommandSpec::write(First));
    }

    fn register_scripting_commands(&mut self) {
        self.register_many(
            &["EVAL", "EVALSHA"],
            CommandSpec::write(KeyLayout::Script)
                .with_flags(CommandFlags::SCRIPTING)
                .with_normalizer(normalize::script),
        );
        self.register("SCRIPT", CommandSpec::write(KeyLayout::None));
    }

    fn register_transaction_commands(&mut self) {
        let transaction = CommandSpec::write(KeyLayout::None).with_flags(CommandFlags::TRANSACTION);
        self.register_many(&["MULTI", "EXEC", "DISCARD", "UNWATCH"], transaction);
        self.register(
            "WATCH",
            CommandSpec::write(KeyLayout::All).with_flags(CommandFlags::TRANSACTION),
        );
    }

    fn register_connection_commands(&mut self) {
        self.register_many(
            &["PING", "ECHO", "AUTH", "SELECT", "QUIT", "ASKING", "READONLY"],
            CommandSpec::read(KeyLayout::None),
        );
    }

    fn register_server_commands(&mut self) {
        self.register("INFO", CommandSpec::admin().with_response(response::info));
        self.register_many(
            &[
                "DBSIZE", "LASTSAVE", "SAVE", "BGSAVE", "BGREWRITEAOF", "SLOWLOG", "MONITOR",
                "SHUTDOWN", "SLAVEOF", "REPLICAOF", "CONFIG",
            ],
            CommandSpec::admin(),
        );
        self.register_many(&["FLUSHDB", "FLUSHALL"], CommandSpec::write(KeyLayout::None));
        self.register_many(&["TIME", "ROLE"], CommandSpec::read(KeyLayout::None));
        self.register_many(&["CLUSTER", "CLIENT"], CommandSpec::new(CommandFlags::empty(), KeyLayout::None));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_case_insensitive() {
        let table = CommandTable::new();
        assert!(table.contains("get"));
        assert!(table.get("Get").unwrap().is_readonly());
        assert!(!table.get("SET").unwrap().is_readonly());
    }

    #[test]
    fn test_unknown_command_gets_generic_spec() {
        let table = CommandTable::new();
        let spec = table.spec("FOO.BAR");
        assert_eq!(spec.keys, KeyLayout::None);
        assert!(spec.flags.contains(CommandFlags::WRITE));
    }

    #[test]
    fn test_create_rejects_unknown_command() {
        let table = CommandTable::new();
        assert!(matches!(table.create("NOPE", vec![]), Err(Error::Client(_))));
        let raw = table.create_raw("NOPE", vec![bytes::Bytes::from_static(b"x")]);
        assert_eq!(raw.id(), "NOPE");
        assert!(raw.keys().is_empty());
    }

    #[test]
    fn test_register_overrides() {
        let mut table = CommandTable::new();
        table.register("get", CommandSpec::write(KeyLayout::First));
        assert!(!table.get("GET").unwrap().is_readonly());
    }

    #[test]
    fn test_flag_groups() {
        let table = CommandTable::new();
        assert!(table.get("INFO").unwrap().flags.contains(CommandFlags::ADMIN));
        assert!(table.get("BLPOP").unwrap().flags.contains(CommandFlags::BLOCKING));
        assert!(table.get("EVALSHA").unwrap().flags.contains(CommandFlags::SCRIPTING));
        assert!(table.get("WATCH").unwrap().flags.contains(CommandFlags::TRANSACTION));
        assert!(table.len() > 100);
    }
}
