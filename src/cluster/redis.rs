//! Server-assisted cluster connection.

use super::slots::{Slot, SlotMap, SlotRange, MAX_SLOT};
use super::strategy::{ClusterStrategy, SlotStrategy};
use crate::command::Command;
use crate::connection::{
    Aggregation, BoxedNode, Connection, ConnectionFactory, ConnectionParameters,
};
use crate::error::{Error, RedirectKind, Redirection, Result};
use crate::protocol::Reply;
use crate::CLUSTER_SLOTS;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Aggregate connection for a cluster that owns slots server-side.
///
/// Commands are routed by the CRC16 slot of their keys. Slots missing
/// from the slot map are guessed by splitting the slot space evenly over
/// the pool. A `MOVED` reply updates the slot map and the command is
/// retried once on the new owner; an `ASK` reply retries once behind
/// `ASKING` without touching the slot map. A second redirection is
/// returned to the caller as is.
pub struct RedisCluster {
    pool: Vec<BoxedNode>,
    slots: SlotMap,
    slots_built: bool,
    factory: Arc<dyn ConnectionFactory>,
    defaults: ConnectionParameters,
    use_cluster_slots: bool,
}

impl RedisCluster {
    /// Create an empty cluster.
    ///
    /// Nodes learned from redirections are built by `factory` from their
    /// address and inherit unset options from `defaults`.
    pub fn new(factory: Arc<dyn ConnectionFactory>, defaults: ConnectionParameters) -> Self {
        Self {
            pool: Vec::new(),
            slots: SlotMap::new(),
            slots_built: false,
            factory,
            defaults,
            use_cluster_slots: false,
        }
    }

    /// Refresh the whole slot map with `CLUSTER SLOTS` after a `MOVED`.
    pub fn use_cluster_slots(mut self, enabled: bool) -> Self {
        self.use_cluster_slots = enabled;
        self
    }

    /// Add a node, replacing any node with the same id.
    ///
    /// Membership changes reset the slot map.
    pub fn add(&mut self, node: BoxedNode) {
        let id = node.id();
        if let Some(existing) = self.pool.iter_mut().find(|n| n.id() == id) {
            existing.disconnect();
            *existing = node;
        } else {
            self.pool.push(node);
        }
        self.reset_slots();
    }

    /// Remove the node with the given id, returning it.
    pub fn remove_by_id(&mut self, id: &str) -> Option<BoxedNode> {
        let position = self.pool.iter().position(|n| n.id() == id)?;
        self.reset_slots();
        Some(self.pool.remove(position))
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.pool.len()
    }

    /// Returns true if the cluster has no nodes.
    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    /// Node ids in insertion order.
    pub fn node_ids(&self) -> Vec<String> {
        self.pool.iter().map(|n| n.id()).collect()
    }

    /// Current slot map, built from static slot ranges if needed.
    pub fn slot_map(&mut self) -> Result<&SlotMap> {
        self.build_slot_map()?;
        Ok(&self.slots)
    }

    /// Forget every slot assignment.
    pub fn reset_slots(&mut self) {
        self.slots.clear();
        self.slots_built = false;
    }

    /// Node owning `slot` (known or guessed).
    pub fn get_connection_by_slot(&mut self, slot: Slot) -> Result<&mut BoxedNode> {
        let index = self.index_for_slot(slot)?;
        Ok(&mut self.pool[index])
    }

    /// Node owning `key`.
    pub fn get_connection_by_key(&mut self, key: &[u8]) -> Result<&mut BoxedNode> {
        self.get_connection_by_slot(super::hash::key_slot(key))
    }

    /// Node owning every key of `command`.
    pub fn get_connection_by_command(&mut self, command: &Command) -> Result<&mut BoxedNode> {
        let index = self.index_for_command(command)?;
        Ok(&mut self.pool[index])
    }

    /// Node with the given id.
    pub fn get_connection_by_id(&mut self, id: &str) -> Option<&mut BoxedNode> {
        self.pool.iter_mut().find(|n| n.id() == id)
    }

    /// Replace the slot map with the `CLUSTER SLOTS` view of a node.
    ///
    /// Asks the first node when `via` is `None`. Owners missing from the
    /// pool are created through the factory.
    pub fn ask_slot_map(&mut self, via: Option<&str>) -> Result<()> {
        let index = match via {
            Some(id) => self
                .pool
                .iter()
                .position(|n| n.id() == id)
                .ok_or_else(|| Error::Routing(format!("node '{id}' is not in the pool")))?,
            None if self.pool.is_empty() => return Err(no_nodes()),
            None => 0,
        };
        let via_host = self.pool[index].parameters().host.clone();
        let command = Command::raw("CLUSTER", vec!["SLOTS".into()]);
        let reply = self.pool[index].execute_command(&command)?.into_result()?;

        let entries = parse_cluster_slots(&reply, &via_host)?;
        self.slots.clear();
        for (range, address) in &entries {
            let owner = self.node_for_address(address)?;
            let id = self.pool[owner].id();
            self.slots.set_slots(*range, &id)?;
        }
        self.slots_built = true;
        info!(ranges = entries.len(), "slot map refreshed from CLUSTER SLOTS");
        Ok(())
    }

    fn build_slot_map(&mut self) -> Result<()> {
        if self.slots_built {
            return Ok(());
        }
        for node in &self.pool {
            let id = node.id();
            for &range in &node.parameters().slots {
                self.slots.set_slots(SlotRange::from(range), &id)?;
            }
        }
        self.slots_built = true;
        Ok(())
    }

    fn index_for_command(&mut self, command: &Command) -> Result<usize> {
        let slot = SlotStrategy
            .command_slot(command)
            .ok_or_else(|| Error::not_supported(command.id(), Aggregation::Cluster.describe()))?;
        self.index_for_slot(slot as Slot)
    }

    fn index_for_slot(&mut self, slot: Slot) -> Result<usize> {
        if slot > MAX_SLOT {
            return Err(Error::Client(format!("invalid slot {slot}")));
        }
        if self.pool.is_empty() {
            return Err(no_nodes());
        }
        self.build_slot_map()?;
        if let Some(id) = self.slots.get(slot) {
            if let Some(index) = self.pool.iter().position(|n| n.id() == id) {
                return Ok(index);
            }
        }
        Ok(self.guess(slot))
    }

    /// Index of the node owning `slot` if slots were split evenly.
    fn guess(&self, slot: Slot) -> usize {
        let count = self.pool.len();
        let per_node = (CLUSTER_SLOTS / count).max(1);
        (usize::from(slot) / per_node).min(count - 1)
    }

    /// Index of the node at `address`, created if unknown.
    fn node_for_address(&mut self, address: &str) -> Result<usize> {
        if let Some(index) = self
            .pool
            .iter()
            .position(|n| n.id() == address || n.parameters().endpoint() == address)
        {
            return Ok(index);
        }
        let mut params = ConnectionParameters::parse(address)?;
        params.inherit(&self.defaults);
        let node = self.factory.create(params)?;
        debug!(node = %address, "cluster node created from redirection");
        self.pool.push(node);
        Ok(self.pool.len() - 1)
    }

    fn on_moved(&mut self, command: &Command, redirection: &Redirection) -> Result<Reply> {
        let index = self.node_for_address(&redirection.addr)?;
        if self.use_cluster_slots {
            let id = self.pool[index].id();
            self.ask_slot_map(Some(id.as_str()))?;
        } else {
            let id = self.pool[index].id();
            self.slots.insert(redirection.slot, &id)?;
        }
        debug!(
            command = command.id(),
            slot = redirection.slot,
            target = %redirection.addr,
            "following MOVED"
        );
        let reply = self.pool[index].execute_command(command)?;
        warn_if_redirected(&reply);
        Ok(reply)
    }

    fn on_ask(&mut self, command: &Command, redirection: &Redirection) -> Result<Reply> {
        let index = self.node_for_address(&redirection.addr)?;
        debug!(
            command = command.id(),
            slot = redirection.slot,
            target = %redirection.addr,
            "following ASK"
        );
        let node = &mut self.pool[index];
        let asking = Command::raw("ASKING", vec![]);
        node.write_request(&asking)?;
        node.write_request(command)?;
        node.read_response(&asking)?.into_result()?;
        let reply = node.read_response(command)?;
        warn_if_redirected(&reply);
        Ok(reply)
    }
}

fn no_nodes() -> Error {
    Error::Routing("cluster has no nodes".into())
}

fn warn_if_redirected(reply: &Reply) {
    if let Reply::Error(e) = reply {
        if e.redirection().is_some() {
            warn!(error = %e, "redirected twice; returning the redirection");
        }
    }
}

/// Parse a `CLUSTER SLOTS` reply into `(range, "host:port")` entries.
///
/// An empty host means "the node you asked".
fn parse_cluster_slots(reply: &Reply, via_host: &str) -> Result<Vec<(SlotRange, String)>> {
    let malformed = || Error::Client("malformed CLUSTER SLOTS reply".into());
    let entries = reply.as_array().ok_or_else(malformed)?;
    let mut ranges = Vec::with_capacity(entries.len());
    for entry in entries {
        let fields = entry.as_array().ok_or_else(malformed)?;
        let (Some(start), Some(end), Some(primary)) = (fields.first(), fields.get(1), fields.get(2))
        else {
            return Err(malformed());
        };
        let start = start.as_integer().and_then(|n| Slot::try_from(n).ok());
        let end = end.as_integer().and_then(|n| Slot::try_from(n).ok());
        let (Some(start), Some(end)) = (start, end) else {
            return Err(malformed());
        };
        let primary = primary.as_array().ok_or_else(malformed)?;
        let host = primary.first().and_then(Reply::as_str).ok_or_else(malformed)?;
        let port = primary.get(1).and_then(Reply::as_integer).ok_or_else(malformed)?;
        let host = if host.is_empty() { via_host } else { host };
        ranges.push((SlotRange::new(start, end), format!("{host}:{port}")));
    }
    Ok(ranges)
}

impl Connection for RedisCluster {
    fn connect(&mut self) -> Result<()> {
        for node in &mut self.pool {
            node.connect()?;
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        for node in &mut self.pool {
            node.disconnect();
        }
    }

    fn is_connected(&self) -> bool {
        self.pool.iter().any(|n| n.is_connected())
    }

    fn write_request(&mut self, command: &Command) -> Result<()> {
        self.get_connection_by_command(command)?.write_request(command)
    }

    fn read_response(&mut self, command: &Command) -> Result<Reply> {
        self.get_connection_by_command(command)?.read_response(command)
    }

    fn execute_command(&mut self, command: &Command) -> Result<Reply> {
        let index = self.index_for_command(command)?;
        let reply = self.pool[index].execute_command(command)?;
        let redirection = match &reply {
            Reply::Error(e) => e.redirection(),
            _ => None,
        };
        match redirection {
            Some(r) if r.kind == RedirectKind::Moved => self.on_moved(command, &r),
            Some(r) => self.on_ask(command, &r),
            None => Ok(reply),
        }
    }

    fn node_id(&mut self, command: &Command) -> Result<String> {
        Ok(self.get_connection_by_command(command)?.id())
    }

    fn aggregation(&self) -> Aggregation {
        Aggregation::Cluster
    }
}

impl std::fmt::Debug for RedisCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCluster")
            .field("nodes", &self.node_ids())
            .field("slots", &self.slots.len())
            .field("use_cluster_slots", &self.use_cluster_slots)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::hash::key_slot;
    use crate::command::CommandTable;
    use crate::connection::mock::{always_ok, MockConnection, MockFactory, Responder};

    const A: &str = "10.0.0.1:6379";
    const B: &str = "10.0.0.2:6380";

    fn cluster(factory: &MockFactory, nodes: &[&str]) -> RedisCluster {
        let defaults = ConnectionParameters::parse("tcp://127.0.0.1:6379?password=secret").unwrap();
        let mut cluster = RedisCluster::new(Arc::new(factory.clone()), defaults);
        for node in nodes {
            cluster.add(MockConnection::boxed(
                node,
                Arc::clone(&factory.responder),
                factory.log.clone(),
            ));
        }
        cluster
    }

    fn get(key: &str) -> Command {
        CommandTable::new().create("GET", vec![key.into()]).unwrap()
    }

    #[test]
    fn test_guess_splits_slots_evenly() {
        let factory = MockFactory::new(always_ok());
        let mut cluster = cluster(&factory, &["n1:1", "n2:2", "n3:3"]);
        assert_eq!(cluster.get_connection_by_slot(0).unwrap().id(), "n1:1");
        assert_eq!(cluster.get_connection_by_slot(5461).unwrap().id(), "n2:2");
        assert_eq!(cluster.get_connection_by_slot(MAX_SLOT).unwrap().id(), "n3:3");
        assert!(matches!(cluster.get_connection_by_slot(16384), Err(Error::Client(_))));
    }

    #[test]
    fn test_static_slot_ranges() {
        let factory = MockFactory::new(always_ok());
        let mut cluster = RedisCluster::new(Arc::new(factory.clone()), ConnectionParameters::default());
        for uri in ["tcp://10.0.0.1:6379?slots=0-99", "tcp://10.0.0.2:6379?slots=100-16383"] {
            let params = ConnectionParameters::parse(uri).unwrap();
            cluster.add(Box::new(MockConnection::with_parameters(
                params,
                always_ok(),
                factory.log.clone(),
            )));
        }
        assert_eq!(cluster.slot_map().unwrap().len(), CLUSTER_SLOTS);
        assert_eq!(cluster.get_connection_by_slot(50).unwrap().id(), "10.0.0.1:6379");
        assert_eq!(cluster.get_connection_by_slot(100).unwrap().id(), "10.0.0.2:6379");
    }

    #[test]
    fn test_moved_retries_once_and_caches_slot() {
        let slot = key_slot(b"foo");
        let moved = format!("MOVED {slot} {B}");
        let responder: Responder = Arc::new(move |endpoint: &str, command: &Command| {
            if endpoint == A && command.is("GET") {
                Ok(Reply::error(moved.clone()))
            } else {
                Ok(Reply::bulk("v"))
            }
        });
        let factory = MockFactory::new(responder);
        let mut cluster = cluster(&factory, &[A]);

        let reply = cluster.execute_command(&get("foo")).unwrap();
        assert_eq!(reply, Reply::bulk("v"));
        assert_eq!(
            factory.log.entries(),
            vec![format!("{A} GET foo"), format!("{B} GET foo")]
        );

        // the new node inherits default credentials
        let created = factory.created();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].endpoint(), B);
        assert_eq!(created[0].password.as_deref(), Some("secret"));
        assert_eq!(cluster.slot_map().unwrap().get(slot), Some(B));

        factory.log.clear();
        cluster.execute_command(&get("foo")).unwrap();
        assert_eq!(factory.log.entries(), vec![format!("{B} GET foo")]);
        assert_eq!(factory.created().len(), 1);
    }

    #[test]
    fn test_second_redirection_is_returned() {
        let responder: Responder =
            Arc::new(|_: &str, _: &Command| Ok(Reply::error("MOVED 12182 10.0.0.2:6380")));
        let factory = MockFactory::new(responder);
        let mut cluster = cluster(&factory, &[A]);

        let reply = cluster.execute_command(&get("foo")).unwrap();
        assert!(matches!(reply, Reply::Error(ref e) if e.kind() == "MOVED"));
        assert_eq!(factory.log.entries().len(), 2);
    }

    #[test]
    fn test_ask_does_not_update_slot_map() {
        let responder: Responder = Arc::new(|endpoint: &str, command: &Command| {
            if endpoint == A && command.is("GET") {
                Ok(Reply::error("ASK 12182 10.0.0.2:6380"))
            } else if command.is("ASKING") {
                Ok(Reply::Ok)
            } else {
                Ok(Reply::bulk("migrating"))
            }
        });
        let factory = MockFactory::new(responder);
        let mut cluster = cluster(&factory, &[A]);

        let reply = cluster.execute_command(&get("foo")).unwrap();
        assert_eq!(reply, Reply::bulk("migrating"));
        assert_eq!(
            factory.log.entries(),
            vec![format!("{A} GET foo"), format!("{B} ASKING"), format!("{B} GET foo")]
        );
        assert_eq!(cluster.slot_map().unwrap().get(12182), None);
        assert_eq!(cluster.len(), 2);
    }

    #[test]
    fn test_moved_with_cluster_slots_refresh() {
        let responder: Responder = Arc::new(|endpoint: &str, command: &Command| {
            if command.is("CLUSTER") {
                return Ok(Reply::Array(vec![
                    Reply::Array(vec![
                        Reply::Integer(0),
                        Reply::Integer(8191),
                        Reply::Array(vec![Reply::bulk("10.0.0.1"), Reply::Integer(6379)]),
                    ]),
                    Reply::Array(vec![
                        Reply::Integer(8192),
                        Reply::Integer(16383),
                        Reply::Array(vec![Reply::bulk(""), Reply::Integer(6380)]),
                    ]),
                ]));
            }
            if endpoint == A {
                Ok(Reply::error("MOVED 12182 10.0.0.2:6380"))
            } else {
                Ok(Reply::bulk("v"))
            }
        });
        let factory = MockFactory::new(responder);
        let mut cluster = cluster(&factory, &[A]).use_cluster_slots(true);

        assert_eq!(cluster.execute_command(&get("foo")).unwrap(), Reply::bulk("v"));
        let map = cluster.slot_map().unwrap();
        assert_eq!(map.get(0), Some(A));
        // empty host resolves to the node that answered
        assert_eq!(map.get(16383), Some(B));
        assert_eq!(map.len(), CLUSTER_SLOTS);
    }

    #[test]
    fn test_cross_slot_and_keyless_rejected() {
        let factory = MockFactory::new(always_ok());
        let mut cluster = cluster(&factory, &[A]);
        let table = CommandTable::new();
        let cross = table.create("MGET", vec!["a{x}".into(), "b{y}".into()]).unwrap();
        assert_eq!(
            cluster.execute_command(&cross).unwrap_err(),
            Error::Routing("Cannot use 'MGET' over a cluster of connections".into())
        );
        let same = table.create("MGET", vec!["a{x}".into(), "b{x}".into()]).unwrap();
        assert!(cluster.execute_command(&same).is_ok());
        assert!(cluster.execute_command(&Command::raw("PING", vec![])).is_err());
    }

    #[test]
    fn test_membership_change_resets_slots() {
        let factory = MockFactory::new(always_ok());
        let mut cluster = cluster(&factory, &[A]);
        cluster.slots.insert(5, A).unwrap();
        cluster.add(MockConnection::boxed(B, always_ok(), factory.log.clone()));
        assert!(cluster.slot_map().unwrap().is_empty());
        assert!(cluster.remove_by_id(B).is_some());
        assert_eq!(cluster.node_ids(), vec![A.to_string()]);
    }
}
