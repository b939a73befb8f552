//! Client configuration.
//!
//! A [`Config`] is built in code or loaded from a directive-per-line file:
//!
//! ```text
//! # two shards behind a common prefix
//! mode sharded
//! ring ketama
//! node tcp://10.0.0.1:6379?alias=first
//! node tcp://10.0.0.2:6379?alias=second&weight=2
//! prefix "app:"
//! timeout 1.5
//! include /etc/cairn/secrets.conf
//! ```

use crate::connection::parameters::ConnectionParameters;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Deepest `include` chain followed before giving up.
const MAX_INCLUDE_DEPTH: usize = 8;

/// How node connections are aggregated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// One node, no routing
    #[default]
    Single,
    /// Client-side consistent hashing over independent nodes
    Sharded,
    /// Server-assisted cluster with 16384 hash slots
    Cluster,
    /// One primary and read replicas
    Replication,
}

/// Consistent-hash ring used in sharded mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RingAlgorithm {
    /// CRC32 positions, successor lookup
    #[default]
    Crc32,
    /// MD5 positions (ketama), predecessor lookup
    Ketama,
}

/// Per-client options.
#[derive(Debug, Clone)]
pub struct Config {
    /// Node endpoints
    pub nodes: Vec<ConnectionParameters>,
    /// Aggregation mode
    pub mode: Mode,
    /// Ring used in sharded mode
    pub ring: RingAlgorithm,
    /// Namespace prepended to every key
    pub prefix: Option<String>,
    /// Raise server error replies instead of returning them inline
    pub exceptions: bool,
    /// Connect timeout inherited by every node
    pub timeout: Option<Duration>,
    /// Read/write timeout inherited by every node
    pub read_write_timeout: Option<Duration>,
    /// Database inherited by every node
    pub database: Option<i64>,
    /// ACL user inherited by every node
    pub username: Option<String>,
    /// Password inherited by every node
    pub password: Option<String>,
    /// Refresh the whole slot map with `CLUSTER SLOTS` after a `MOVED`
    pub cluster_slots: bool,
    /// Keep reading from the primary after a write
    pub stick_to_primary: bool,
    /// Discover replicas from the primary on startup
    pub autodiscovery: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            mode: Mode::Single,
            ring: RingAlgorithm::Crc32,
            prefix: None,
            exceptions: true,
            timeout: None,
            read_write_timeout: None,
            database: None,
            username: None,
            password: None,
            cluster_slots: false,
            stick_to_primary: false,
            autodiscovery: false,
        }
    }
}

impl Config {
    /// Create a new configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: add a node from a URI.
    pub fn node(mut self, uri: &str) -> Result<Self, ConfigError> {
        self.nodes.push(ConnectionParameters::parse(uri)?);
        Ok(self)
    }

    /// Builder: add node parameters.
    pub fn parameters(mut self, params: ConnectionParameters) -> Self {
        self.nodes.push(params);
        self
    }

    /// Builder: set the aggregation mode.
    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Builder: set the ring algorithm.
    pub fn ring(mut self, ring: RingAlgorithm) -> Self {
        self.ring = ring;
        self
    }

    /// Builder: set the key prefix.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Builder: raise or inline server errors.
    pub fn exceptions(mut self, enabled: bool) -> Self {
        self.exceptions = enabled;
        self
    }

    /// Builder: set the password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Builder: set the database.
    pub fn database(mut self, database: i64) -> Self {
        self.database = Some(database);
        self
    }

    /// Builder: keep reads on the primary after a write.
    pub fn stick_to_primary(mut self, enabled: bool) -> Self {
        self.stick_to_primary = enabled;
        self
    }

    /// Template inherited by every node, including nodes created on a
    /// cluster redirection.
    pub fn default_parameters(&self) -> ConnectionParameters {
        let mut params = ConnectionParameters::default();
        params.timeout = self.timeout;
        params.read_write_timeout = self.read_write_timeout;
        params.database = self.database;
        params.username.clone_from(&self.username);
        params.password.clone_from(&self.password);
        params
    }

    /// Node parameters with the defaults applied.
    pub fn resolved_nodes(&self) -> Vec<ConnectionParameters> {
        let defaults = self.default_parameters();
        self.nodes
            .iter()
            .cloned()
            .map(|mut params| {
                params.inherit(&defaults);
                params
            })
            .collect()
    }

    /// Load configuration from a file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        config.apply_file(path.as_ref(), 0)?;
        Ok(config)
    }

    /// Parse configuration from a string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        config.apply_str(content, 0)?;
        Ok(config)
    }

    fn apply_file(&mut self, path: &Path, depth: usize) -> Result<(), ConfigError> {
        if depth > MAX_INCLUDE_DEPTH {
            return Err(ConfigError::Io(format!(
                "include nesting too deep at {}",
                path.display()
            )));
        }
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        self.apply_str(&content, depth)
    }

    fn apply_str(&mut self, content: &str, depth: usize) -> Result<(), ConfigError> {
        let mut includes: Vec<PathBuf> = Vec::new();

        for (line_num, line) in content.lines().enumerate() {
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (directive, value) = Self::parse_line(line).ok_or_else(|| ConfigError::Parse {
                line: line_num + 1,
                message: "Invalid directive format".to_string(),
            })?;

            if directive.eq_ignore_ascii_case("include") {
                includes.push(PathBuf::from(value));
                continue;
            }

            self.apply_directive(&directive.to_lowercase(), value, line_num + 1)?;
        }

        // Included files override the including one
        for include_path in includes {
            self.apply_file(&include_path, depth + 1)?;
        }

        Ok(())
    }

    /// Parse a single config line into directive and value.
    fn parse_line(line: &str) -> Option<(&str, &str)> {
        let mut parts = line.splitn(2, char::is_whitespace);
        let directive = parts.next()?.trim();
        let value = parts.next().map(str::trim).unwrap_or("");

        let value = if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
            &value[1..value.len() - 1]
        } else {
            value
        };

        Some((directive, value))
    }

    /// Apply a single directive to the config.
    fn apply_directive(&mut self, directive: &str, value: &str, line: usize) -> Result<(), ConfigError> {
        match directive {
            "node" => {
                let params = ConnectionParameters::parse(value).map_err(|e| ConfigError::Parse {
                    line,
                    message: e.to_string(),
                })?;
                self.nodes.push(params);
            }
            "mode" => {
                self.mode = match value.to_lowercase().as_str() {
                    "single" => Mode::Single,
                    "sharded" => Mode::Sharded,
                    "cluster" | "redis" => Mode::Cluster,
                    "replication" => Mode::Replication,
                    _ => {
                        return Err(ConfigError::Parse {
                            line,
                            message: format!("Invalid mode: {value}"),
                        })
                    }
                };
            }
            "ring" => {
                self.ring = match value.to_lowercase().as_str() {
                    "crc32" => RingAlgorithm::Crc32,
                    "ketama" => RingAlgorithm::Ketama,
                    _ => {
                        return Err(ConfigError::Parse {
                            line,
                            message: format!("Invalid ring: {value}"),
                        })
                    }
                };
            }
            "prefix" => {
                self.prefix = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "exceptions" => self.exceptions = parse_bool(value, line)?,
            "timeout" => self.timeout = Some(parse_seconds(value, line)?),
            "read-write-timeout" => self.read_write_timeout = Some(parse_seconds(value, line)?),
            "database" => self.database = Some(parse_number(value, line)?),
            "username" => self.username = Some(value.to_string()),
            "password" | "requirepass" => self.password = Some(value.to_string()),
            "cluster-slots" => self.cluster_slots = parse_bool(value, line)?,
            "stick-to-primary" => self.stick_to_primary = parse_bool(value, line)?,
            "autodiscovery" => self.autodiscovery = parse_bool(value, line)?,
            _ => {
                return Err(ConfigError::Parse {
                    line,
                    message: format!("Unknown directive: {directive}"),
                })
            }
        }

        Ok(())
    }

    /// Convert configuration to config file format.
    pub fn to_config_string(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("mode {}", mode_name(self.mode)));
        lines.push(format!(
            "ring {}",
            match self.ring {
                RingAlgorithm::Crc32 => "crc32",
                RingAlgorithm::Ketama => "ketama",
            }
        ));
        for node in &self.nodes {
            lines.push(format!("node {}", node_uri(node)));
        }
        if let Some(ref prefix) = self.prefix {
            lines.push(format!("prefix \"{prefix}\""));
        }
        lines.push(format!("exceptions {}", yes_no(self.exceptions)));
        if let Some(timeout) = self.timeout {
            lines.push(format!("timeout {}", timeout.as_secs_f64()));
        }
        if let Some(timeout) = self.read_write_timeout {
            lines.push(format!("read-write-timeout {}", timeout.as_secs_f64()));
        }
        if let Some(database) = self.database {
            lines.push(format!("database {database}"));
        }
        if let Some(ref username) = self.username {
            lines.push(format!("username \"{username}\""));
        }
        if let Some(ref password) = self.password {
            lines.push(format!("password \"{password}\""));
        }
        lines.push(format!("cluster-slots {}", yes_no(self.cluster_slots)));
        lines.push(format!("stick-to-primary {}", yes_no(self.stick_to_primary)));
        lines.push(format!("autodiscovery {}", yes_no(self.autodiscovery)));

        lines.join("\n")
    }
}

/// Configuration error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// I/O error reading a config file
    #[error("config I/O error: {0}")]
    Io(String),

    /// Parse error in a config file
    #[error("config error at line {line}: {message}")]
    Parse {
        /// 1-based line number
        line: usize,
        /// What is wrong
        message: String,
    },

    /// Malformed connection URI
    #[error("invalid connection URI '{uri}': {message}")]
    InvalidUri {
        /// The URI as given
        uri: String,
        /// What is wrong
        message: String,
    },

    /// Options that parse but cannot work together
    #[error("{0}")]
    Invalid(String),
}

fn mode_name(mode: Mode) -> &'static str {
    match mode {
        Mode::Single => "single",
        Mode::Sharded => "sharded",
        Mode::Cluster => "cluster",
        Mode::Replication => "replication",
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn node_uri(node: &ConnectionParameters) -> String {
    let mut query = Vec::new();
    if let Some(ref alias) = node.alias {
        query.push(format!("alias={alias}"));
    }
    if let Some(weight) = node.weight {
        query.push(format!("weight={weight}"));
    }
    if !node.slots.is_empty() {
        let ranges: Vec<String> = node.slots.iter().map(|(s, e)| format!("{s}-{e}")).collect();
        query.push(format!("slots={}", ranges.join(",")));
    }
    if let Some(role) = node.role {
        query.push(format!(
            "role={}",
            match role {
                crate::connection::parameters::Role::Primary => "master",
                crate::connection::parameters::Role::Replica => "slave",
            }
        ));
    }
    if query.is_empty() {
        node.to_string()
    } else {
        format!("{node}?{}", query.join("&"))
    }
}

fn parse_bool(value: &str, line: usize) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "yes" | "true" | "1" => Ok(true),
        "no" | "false" | "0" => Ok(false),
        _ => Err(ConfigError::Parse {
            line,
            message: format!("Invalid boolean: {value}"),
        }),
    }
}

fn parse_number<T: std::str::FromStr>(value: &str, line: usize) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Parse {
        line,
        message: format!("Invalid number: {value}"),
    })
}

fn parse_seconds(value: &str, line: usize) -> Result<Duration, ConfigError> {
    let secs: f64 = parse_number(value, line)?;
    Duration::try_from_secs_f64(secs).map_err(|_| ConfigError::Parse {
        line,
        message: format!("Invalid duration: {value}"),
    })
}
