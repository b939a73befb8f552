//! Connection parameters.
//!
//! Parameters are usually written as URIs:
//!
//! ```text
//! tcp://10.0.0.1:6379?alias=first&weight=2&database=1&timeout=0.5
//! tcp://:secret@10.0.0.2:6380?slots=0-5460,5500
//! unix:///var/run/redis.sock?database=3
//! 127.0.0.1:6379
//! ```

use crate::config::ConfigError;
use crate::DEFAULT_PORT;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use url::{Host, Url};

/// Connect timeout used when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    /// TCP socket
    #[default]
    Tcp,
    /// Unix domain socket
    Unix,
}

/// Role a node plays in a replication group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Accepts writes
    Primary,
    /// Read-only copy
    Replica,
}

/// Endpoint descriptor for one node. Immutable once handed to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParameters {
    /// Transport
    pub scheme: Scheme,
    /// Host name or address (TCP)
    pub host: String,
    /// Port (TCP)
    pub port: u16,
    /// Socket path (Unix)
    pub path: Option<PathBuf>,
    /// Connect timeout
    pub timeout: Option<Duration>,
    /// Read/write timeout on the established stream
    pub read_write_timeout: Option<Duration>,
    /// Node alias, used as node id when present
    pub alias: Option<String>,
    /// Node weight for client-side sharding
    pub weight: Option<u32>,
    /// Statically assigned cluster slot ranges (inclusive)
    pub slots: Vec<(u16, u16)>,
    /// Database selected on connect
    pub database: Option<i64>,
    /// ACL user name sent with `AUTH`
    pub username: Option<String>,
    /// Password sent with `AUTH`
    pub password: Option<String>,
    /// Replication role
    pub role: Option<Role>,
}

impl Default for ConnectionParameters {
    fn default() -> Self {
        Self::tcp("127.0.0.1", DEFAULT_PORT)
    }
}

impl ConnectionParameters {
    /// Parameters for a TCP endpoint.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: Scheme::Tcp,
            host: host.into(),
            port,
            path: None,
            timeout: None,
            read_write_timeout: None,
            alias: None,
            weight: None,
            slots: Vec::new(),
            database: None,
            username: None,
            password: None,
            role: None,
        }
    }

    /// Parameters for a Unix socket endpoint.
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self {
            scheme: Scheme::Unix,
            path: Some(path.into()),
            ..Self::tcp("", 0)
        }
    }

    /// Parse a URI (or a bare `host:port`).
    pub fn parse(uri: &str) -> Result<Self, ConfigError> {
        let uri = uri.trim();
        let invalid = |message: &str| ConfigError::InvalidUri {
            uri: uri.to_string(),
            message: message.to_string(),
        };

        let normalized = if uri.contains("://") {
            uri.to_string()
        } else {
            format!("tcp://{uri}")
        };
        let url = Url::parse(&normalized).map_err(|e| invalid(&e.to_string()))?;

        let mut params = match url.scheme() {
            "tcp" | "redis" => {
                let host = match url.host().ok_or_else(|| invalid("missing host"))? {
                    Host::Domain(domain) => domain.to_string(),
                    Host::Ipv4(addr) => addr.to_string(),
                    // stored without the brackets so it resolves as an address
                    Host::Ipv6(addr) => addr.to_string(),
                };
                Self::tcp(host, url.port().unwrap_or(DEFAULT_PORT))
            }
            "unix" => {
                if url.path().is_empty() || url.path() == "/" {
                    return Err(invalid("missing socket path"));
                }
                Self::unix(url.path())
            }
            other => return Err(invalid(&format!("unsupported scheme '{other}'"))),
        };

        if !url.username().is_empty() {
            params.username = Some(url.username().to_string());
        }
        if let Some(password) = url.password() {
            params.password = Some(password.to_string());
        }

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "alias" => params.alias = Some(value.into_owned()),
                "weight" => {
                    params.weight = Some(value.parse().map_err(|_| invalid("invalid weight"))?);
                }
                "database" | "db" => {
                    params.database =
                        Some(value.parse().map_err(|_| invalid("invalid database"))?);
                }
                "username" => params.username = Some(value.into_owned()),
                "password" => params.password = Some(value.into_owned()),
                "timeout" => {
                    params.timeout =
                        Some(parse_seconds(&value).ok_or_else(|| invalid("invalid timeout"))?);
                }
                "read_write_timeout" => {
                    params.read_write_timeout = Some(
                        parse_seconds(&value).ok_or_else(|| invalid("invalid read_write_timeout"))?,
                    );
                }
                "slots" => {
                    params.slots =
                        parse_slot_ranges(&value).ok_or_else(|| invalid("invalid slots"))?;
                }
                "role" => {
                    params.role = Some(match value.to_ascii_lowercase().as_str() {
                        "master" | "primary" => Role::Primary,
                        "slave" | "replica" => Role::Replica,
                        _ => return Err(invalid("invalid role")),
                    });
                }
                // Unknown options are ignored
                _ => {}
            }
        }

        Ok(params)
    }

    /// Node identity: the alias if set, otherwise the endpoint.
    pub fn id(&self) -> String {
        match &self.alias {
            Some(alias) => alias.clone(),
            None => self.endpoint(),
        }
    }

    /// `host:port` for TCP, the socket path for Unix.
    pub fn endpoint(&self) -> String {
        match self.scheme {
            Scheme::Tcp if self.host.contains(':') => format!("[{}]:{}", self.host, self.port),
            Scheme::Tcp => format!("{}:{}", self.host, self.port),
            Scheme::Unix => self
                .path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        }
    }

    /// Connect timeout, falling back to [`DEFAULT_TIMEOUT`].
    pub fn connect_timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_TIMEOUT)
    }

    /// Fill every unset option from `defaults`.
    ///
    /// Endpoint, alias, weight, slots and role are never inherited.
    pub fn inherit(&mut self, defaults: &ConnectionParameters) {
        if self.timeout.is_none() {
            self.timeout = defaults.timeout;
        }
        if self.read_write_timeout.is_none() {
            self.read_write_timeout = defaults.read_write_timeout;
        }
        if self.database.is_none() {
            self.database = defaults.database;
        }
        if self.username.is_none() {
            self.username.clone_from(&defaults.username);
        }
        if self.password.is_none() {
            self.password.clone_from(&defaults.password);
        }
    }

    /// Builder: set the alias.
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Builder: set the weight.
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }

    /// Builder: set the role.
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }
}

impl FromStr for ConnectionParameters {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ConnectionParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scheme {
            Scheme::Tcp => write!(f, "tcp://{}:{}", self.host, self.port),
            Scheme::Unix => write!(f, "unix://{}", self.endpoint()),
        }
    }
}

fn parse_seconds(value: &str) -> Option<Duration> {
    let secs: f64 = value.parse().ok()?;
    Duration::try_from_secs_f64(secs).ok()
}

/// `0-5460,5500,6000-6100`
fn parse_slot_ranges(value: &str) -> Option<Vec<(u16, u16)>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (start, end) = match part.split_once('-') {
                Some((s, e)) => (s.trim().parse().ok()?, e.trim().parse().ok()?),
                None => {
                    let slot = part.parse().ok()?;
                    (slot, slot)
                }
            };
            (start <= end && usize::from(end) < crate::CLUSTER_SLOTS).then_some((start, end))
        })
        .collect()
}
