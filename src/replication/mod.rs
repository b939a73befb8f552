//! Primary/replica routing.
//!
//! [`Replication`] sends writes to the primary and reads to a replica
//! picked at random. The replica stays selected until a write moves the
//! connection back to the primary; the next read then picks again.

pub mod strategy;

pub use strategy::{ReadOnlyCheck, ReadOnlyRule, ReplicationStrategy};

use crate::command::Command;
use crate::connection::{
    Aggregation, BoxedNode, Connection, ConnectionFactory, ConnectionParameters, Role,
};
use crate::error::{Error, Result};
use crate::protocol::Reply;
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, info};

/// Node the next read goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Current {
    /// Pick a replica on the next read
    Unset,
    /// Pinned to the primary
    Primary,
    /// Sticky replica
    Replica(usize),
}

/// Aggregate connection over one primary and any number of replicas.
pub struct Replication {
    primary: Option<BoxedNode>,
    replicas: Vec<BoxedNode>,
    current: Current,
    strategy: ReplicationStrategy,
    stick_to_primary: bool,
    factory: Option<Arc<dyn ConnectionFactory>>,
    defaults: ConnectionParameters,
}

impl Replication {
    /// Create an empty replication group.
    pub fn new() -> Self {
        Self {
            primary: None,
            replicas: Vec::new(),
            current: Current::Unset,
            strategy: ReplicationStrategy::new(),
            stick_to_primary: false,
            factory: None,
            defaults: ConnectionParameters::default(),
        }
    }

    /// Keep reading from the primary once a write went there.
    pub fn stick_to_primary(mut self, enabled: bool) -> Self {
        self.stick_to_primary = enabled;
        self
    }

    /// Factory and default parameters used by [`Replication::discover`].
    pub fn with_factory(
        mut self,
        factory: Arc<dyn ConnectionFactory>,
        defaults: ConnectionParameters,
    ) -> Self {
        self.factory = Some(factory);
        self.defaults = defaults;
        self
    }

    /// Command classification.
    pub fn strategy(&self) -> &ReplicationStrategy {
        &self.strategy
    }

    /// Mutable command classification.
    pub fn strategy_mut(&mut self) -> &mut ReplicationStrategy {
        &mut self.strategy
    }

    /// Add a node.
    ///
    /// Nodes with the primary role (or the alias `master`) replace the
    /// primary; every other node is a replica.
    pub fn add(&mut self, node: BoxedNode) {
        let params = node.parameters();
        let is_primary = params.role == Some(Role::Primary)
            || params.alias.as_deref() == Some("master");
        if is_primary {
            if let Some(mut old) = self.primary.replace(node) {
                old.disconnect();
            }
        } else {
            let id = node.id();
            match self.replicas.iter().position(|n| n.id() == id) {
                Some(index) => self.replicas[index] = node,
                None => self.replicas.push(node),
            }
        }
        self.current = Current::Unset;
    }

    /// Remove the node with the given id, returning it.
    pub fn remove_by_id(&mut self, id: &str) -> Option<BoxedNode> {
        self.current = Current::Unset;
        if self.primary.as_ref().is_some_and(|p| p.id() == id) {
            return self.primary.take();
        }
        let index = self.replicas.iter().position(|n| n.id() == id)?;
        Some(self.replicas.remove(index))
    }

    /// The primary, if any.
    pub fn primary(&self) -> Option<&BoxedNode> {
        self.primary.as_ref()
    }

    /// Replicas in insertion order.
    pub fn replicas(&self) -> &[BoxedNode] {
        &self.replicas
    }

    /// Id of the node reads currently go to, if one is selected.
    pub fn current_id(&self) -> Option<String> {
        match self.current {
            Current::Unset => None,
            Current::Primary => self.primary.as_ref().map(|p| p.id()),
            Current::Replica(index) => self.replicas.get(index).map(|r| r.id()),
        }
    }

    /// Pin reads to the primary until another node is selected.
    pub fn switch_to_primary(&mut self) -> Result<()> {
        if self.primary.is_none() {
            return Err(no_primary());
        }
        self.current = Current::Primary;
        Ok(())
    }

    /// Select a random replica (the primary if there is none).
    pub fn switch_to_replica(&mut self) -> Result<()> {
        self.current = self.pick_replica()?;
        Ok(())
    }

    /// Select the node with the given id.
    pub fn switch_to(&mut self, id: &str) -> Result<()> {
        if self.primary.as_ref().is_some_and(|p| p.id() == id) {
            self.current = Current::Primary;
            return Ok(());
        }
        let index = self
            .replicas
            .iter()
            .position(|n| n.id() == id)
            .ok_or_else(|| Error::Routing(format!("node '{id}' is not in the replication group")))?;
        self.current = Current::Replica(index);
        Ok(())
    }

    /// Rebuild the replica list from `INFO REPLICATION` on the primary.
    pub fn discover(&mut self) -> Result<()> {
        let factory = self
            .factory
            .clone()
            .ok_or_else(|| Error::Client("replica discovery needs a connection factory".into()))?;
        let primary = self.primary.as_mut().ok_or_else(no_primary)?;
        let command = Command::raw("INFO", vec!["REPLICATION".into()]);
        let reply = primary.execute_command(&command)?.into_result()?;
        let text = reply
            .as_str()
            .ok_or_else(|| Error::Client("unexpected INFO reply".into()))?;

        let mut replicas = Vec::new();
        for (host, port) in parse_replicas(text) {
            let mut params = ConnectionParameters::tcp(host, port).with_role(Role::Replica);
            params.inherit(&self.defaults);
            replicas.push(factory.create(params)?);
        }
        info!(replicas = replicas.len(), "replicas discovered");
        for mut old in std::mem::replace(&mut self.replicas, replicas) {
            old.disconnect();
        }
        self.current = Current::Unset;
        Ok(())
    }

    fn pick_replica(&self) -> Result<Current> {
        if self.replicas.is_empty() {
            if self.primary.is_none() {
                return Err(no_primary());
            }
            return Ok(Current::Primary);
        }
        let index = rand::thread_rng().gen_range(0..self.replicas.len());
        Ok(Current::Replica(index))
    }

    fn node(&mut self, target: Current) -> Result<&mut BoxedNode> {
        match target {
            Current::Replica(index) => self
                .replicas
                .get_mut(index)
                .ok_or_else(|| Error::Routing("replica index out of range".into())),
            _ => self.primary.as_mut().ok_or_else(no_primary),
        }
    }

    /// Route `command`, updating the sticky selection.
    fn route(&mut self, command: &Command) -> Result<&mut BoxedNode> {
        let target = if self.strategy.is_read_operation(command)? {
            if self.current == Current::Unset {
                self.current = self.pick_replica()?;
                debug!(node = ?self.current_id(), "selected node for reads");
            }
            self.current
        } else {
            // an explicit pin to the primary survives writes
            if self.stick_to_primary || self.current == Current::Primary {
                self.current = Current::Primary;
            } else {
                self.current = Current::Unset;
            }
            Current::Primary
        };
        self.node(target)
    }

    /// Node `command` was last routed to, without changing the selection.
    fn routed(&mut self, command: &Command) -> Result<&mut BoxedNode> {
        let target = if self.strategy.is_read_operation(command)? && self.current != Current::Unset {
            self.current
        } else {
            Current::Primary
        };
        self.node(target)
    }
}

fn no_primary() -> Error {
    Error::Routing("replication group has no primary".into())
}

/// `(host, port)` of every online replica listed by `INFO REPLICATION`.
fn parse_replicas(info: &str) -> Vec<(String, u16)> {
    let mut replicas = Vec::new();
    for line in info.lines() {
        let Some((name, fields)) = line.trim().split_once(':') else {
            continue;
        };
        let is_replica_line = name
            .strip_prefix("slave")
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()));
        if !is_replica_line {
            continue;
        }
        let mut ip = None;
        let mut port = None;
        let mut online = true;
        for field in fields.split(',') {
            match field.split_once('=') {
                Some(("ip", value)) => ip = Some(value.to_string()),
                Some(("port", value)) => port = value.parse().ok(),
                Some(("state", value)) => online = value == "online",
                _ => {}
            }
        }
        if let (Some(ip), Some(port), true) = (ip, port, online) {
            replicas.push((ip, port));
        }
    }
    replicas
}

impl Default for Replication {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection for Replication {
    fn connect(&mut self) -> Result<()> {
        if let Some(primary) = self.primary.as_mut() {
            primary.connect()?;
        }
        if let Current::Replica(index) = self.current {
            if let Some(replica) = self.replicas.get_mut(index) {
                replica.connect()?;
            }
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(primary) = self.primary.as_mut() {
            primary.disconnect();
        }
        for replica in &mut self.replicas {
            replica.disconnect();
        }
    }

    fn is_connected(&self) -> bool {
        match self.current {
            Current::Replica(index) => self.replicas.get(index).is_some_and(|r| r.is_connected()),
            _ => self.primary.as_ref().is_some_and(|p| p.is_connected()),
        }
    }

    fn write_request(&mut self, command: &Command) -> Result<()> {
        self.route(command)?.write_request(command)
    }

    fn read_response(&mut self, command: &Command) -> Result<Reply> {
        self.routed(command)?.read_response(command)
    }

    fn node_id(&mut self, command: &Command) -> Result<String> {
        Ok(self.routed(command)?.id())
    }

    fn aggregation(&self) -> Aggregation {
        Aggregation::Replication
    }

    fn switch_to_primary(&mut self) -> Result<()> {
        Replication::switch_to_primary(self)
    }
}

impl std::fmt::Debug for Replication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replication")
            .field("primary", &self.primary.as_ref().map(|p| p.id()))
            .field("replicas", &self.replicas.iter().map(|r| r.id()).collect::<Vec<_>>())
            .field("current", &self.current)
            .finish()
    }
}
