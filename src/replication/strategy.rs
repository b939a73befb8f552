//! Read-only classification of commands in replication mode.

use crate::cluster::hash::sha1_hex;
use crate::command::{Command, CommandFlags};
use crate::connection::Aggregation;
use crate::error::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Decides whether a particular command is read-only.
pub type ReadOnlyCheck = Arc<dyn Fn(&Command) -> bool + Send + Sync>;

/// Per-command classification override.
#[derive(Clone)]
pub enum ReadOnlyRule {
    /// Always read-only
    Always,
    /// Never read-only
    Never,
    /// Decided per invocation
    Check(ReadOnlyCheck),
}

impl std::fmt::Debug for ReadOnlyRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Always => f.write_str("Always"),
            Self::Never => f.write_str("Never"),
            Self::Check(_) => f.write_str("Check(..)"),
        }
    }
}

/// Classifies commands for primary/replica routing.
///
/// The command flags are the default. Overrides handle commands whose
/// nature depends on their arguments (`SORT ... STORE`, `BITFIELD ... SET`,
/// `GEORADIUS ... STORE`) and scripts known not to write.
#[derive(Debug, Clone)]
pub struct ReplicationStrategy {
    overrides: HashMap<String, ReadOnlyRule>,
    readonly_scripts: HashSet<String>,
}

impl Default for ReplicationStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicationStrategy {
    /// Create a strategy with the built-in overrides.
    pub fn new() -> Self {
        let mut strategy = Self {
            overrides: HashMap::new(),
            readonly_scripts: HashSet::new(),
        };
        strategy.set_command_rule("SORT", unless_option(&["STORE"]));
        strategy.set_command_rule("BITFIELD", unless_option(&["SET", "INCRBY"]));
        let georadius = unless_option(&["STORE", "STOREDIST"]);
        strategy.set_command_rule("GEORADIUS", georadius.clone());
        strategy.set_command_rule("GEORADIUSBYMEMBER", georadius);
        strategy
    }

    /// Override the classification of a command id.
    pub fn set_command_rule(&mut self, id: &str, rule: ReadOnlyRule) {
        self.overrides.insert(id.to_ascii_uppercase(), rule);
    }

    /// Mark a command id as always (or never) read-only.
    pub fn set_command_read_only(&mut self, id: &str, readonly: bool) {
        let rule = if readonly {
            ReadOnlyRule::Always
        } else {
            ReadOnlyRule::Never
        };
        self.set_command_rule(id, rule);
    }

    /// Mark a script body as read-only, for both `EVAL` and `EVALSHA`.
    pub fn set_script_read_only(&mut self, script: &str, readonly: bool) {
        let sha = sha1_hex(script.as_bytes());
        if readonly {
            self.readonly_scripts.insert(sha);
        } else {
            self.readonly_scripts.remove(&sha);
        }
    }

    /// Returns true if `command` may go to a replica.
    ///
    /// Commands refused in replication mode are an error.
    pub fn is_read_operation(&self, command: &Command) -> Result<bool> {
        if command.flags().contains(CommandFlags::ADMIN) {
            return Err(Error::Routing(format!(
                "The command '{}' is not allowed in {}",
                command.id(),
                Aggregation::Replication.describe()
            )));
        }
        if let Some(rule) = self.overrides.get(command.id()) {
            return Ok(match rule {
                ReadOnlyRule::Always => true,
                ReadOnlyRule::Never => false,
                ReadOnlyRule::Check(check) => check(command),
            });
        }
        if command.is("EVAL") {
            return Ok(self.is_readonly_script(command.argument(0), true));
        }
        if command.is("EVALSHA") {
            return Ok(self.is_readonly_script(command.argument(0), false));
        }
        Ok(command.spec().is_readonly())
    }

    fn is_readonly_script(&self, script: Option<&bytes::Bytes>, body: bool) -> bool {
        let Some(script) = script else {
            return false;
        };
        let sha = if body {
            sha1_hex(script)
        } else {
            String::from_utf8_lossy(script).to_ascii_lowercase()
        };
        self.readonly_scripts.contains(&sha)
    }
}

/// Read-only unless one of `options` appears after the first argument.
fn unless_option(options: &'static [&'static str]) -> ReadOnlyRule {
    ReadOnlyRule::Check(Arc::new(move |command: &Command| {
        !command
            .arguments()
            .iter()
            .skip(1)
            .any(|arg| options.iter().any(|option| arg.eq_ignore_ascii_case(option.as_bytes())))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandTable;

    fn command(id: &str, args: &[&str]) -> Command {
        let args = args.iter().map(|a| (*a).into()).collect();
        CommandTable::new().create(id, args).unwrap()
    }

    #[test]
    fn test_flags_decide_by_default() {
        let strategy = ReplicationStrategy::new();
        assert!(strategy.is_read_operation(&command("GET", &["k"])).unwrap());
        assert!(!strategy.is_read_operation(&command("SET", &["k", "v"])).unwrap());
        assert!(!strategy.is_read_operation(&command("BLPOP", &["k", "0"])).unwrap());
    }

    #[test]
    fn test_admin_commands_rejected() {
        let strategy = ReplicationStrategy::new();
        let err = strategy.is_read_operation(&command("INFO", &[])).unwrap_err();
        assert_eq!(
            err,
            Error::Routing("The command 'INFO' is not allowed in a replication group".into())
        );
    }

    #[test]
    fn test_argument_dependent_commands() {
        let strategy = ReplicationStrategy::new();
        assert!(strategy.is_read_operation(&command("SORT", &["k", "LIMIT", "0", "1"])).unwrap());
        assert!(!strategy.is_read_operation(&command("SORT", &["k", "STORE", "d"])).unwrap());
        assert!(strategy.is_read_operation(&command("BITFIELD", &["k", "GET", "u8", "0"])).unwrap());
        assert!(!strategy
            .is_read_operation(&command("BITFIELD", &["k", "INCRBY", "u8", "0", "1"]))
            .unwrap());
        assert!(!strategy
            .is_read_operation(&command("GEORADIUS", &["k", "0", "0", "1", "km", "STOREDIST", "d"]))
            .unwrap());
    }

    #[test]
    fn test_scripts() {
        let mut strategy = ReplicationStrategy::new();
        let body = "return redis.call('GET', KEYS[1])";
        let eval = command("EVAL", &[body, "1", "k"]);
        assert!(!strategy.is_read_operation(&eval).unwrap());

        strategy.set_script_read_only(body, true);
        assert!(strategy.is_read_operation(&eval).unwrap());

        let sha = sha1_hex(body.as_bytes()).to_ascii_uppercase();
        let evalsha = command("EVALSHA", &[sha.as_str(), "1", "k"]);
        assert!(strategy.is_read_operation(&evalsha).unwrap());

        strategy.set_script_read_only(body, false);
        assert!(!strategy.is_read_operation(&eval).unwrap());
    }

    #[test]
    fn test_user_overrides() {
        let mut strategy = ReplicationStrategy::new();
        strategy.set_command_read_only("get", false);
        assert!(!strategy.is_read_operation(&command("GET", &["k"])).unwrap());
        strategy.set_command_read_only("SET", true);
        assert!(strategy.is_read_operation(&command("SET", &["k", "v"])).unwrap());
    }
}
