//! Client-side sharding over independent nodes.

use super::distributor::{Distributor, HashRing};
use super::hash;
use super::strategy::{ClusterStrategy, RingStrategy};
use crate::command::Command;
use crate::config::RingAlgorithm;
use crate::connection::{Aggregation, BoxedNode, Connection};
use crate::error::{Error, Result};
use crate::protocol::Reply;
use tracing::debug;

/// Aggregate connection routing each command by consistent hashing.
pub struct ShardedCluster {
    pool: Vec<BoxedNode>,
    distributor: Box<dyn Distributor>,
}

impl ShardedCluster {
    /// Create an empty cluster using `algorithm` for the ring.
    pub fn new(algorithm: RingAlgorithm) -> Self {
        Self::with_distributor(Box::new(HashRing::new(algorithm)))
    }

    /// Create an empty cluster around a custom distributor.
    pub fn with_distributor(distributor: Box<dyn Distributor>) -> Self {
        Self {
            pool: Vec::new(),
            distributor,
        }
    }

    /// Add a node, replacing any node with the same id.
    pub fn add(&mut self, node: BoxedNode) {
        let id = node.id();
        let weight = node.parameters().weight;
        if let Some(existing) = self.pool.iter_mut().find(|n| n.id() == id) {
            existing.disconnect();
            *existing = node;
        } else {
            self.pool.push(node);
        }
        self.distributor.add(&id, weight);
        debug!(node = %id, ?weight, "node added to sharded cluster");
    }

    /// Remove the node with the given id, returning it.
    pub fn remove_by_id(&mut self, id: &str) -> Option<BoxedNode> {
        let position = self.pool.iter().position(|n| n.id() == id)?;
        self.distributor.remove(id);
        debug!(node = %id, "node removed from sharded cluster");
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

    /// The ring.
    pub fn distributor(&self) -> &dyn Distributor {
        &*self.distributor
    }

    /// Node owning every key of `command`.
    pub fn get_connection_by_command(&mut self, command: &Command) -> Result<&mut BoxedNode> {
        self.ensure_nodes()?;
        let strategy = RingStrategy(&*self.distributor);
        let slot = strategy
            .command_slot(command)
            .ok_or_else(|| Error::not_supported(command.id(), Aggregation::Sharded.describe()))?;
        // a position cached before a membership change may be gone
        let id = match self.distributor.get_by_slot(slot) {
            Some(id) => id,
            None => strategy
                .keys_slot(command)
                .and_then(|slot| self.distributor.get_by_slot(slot))
                .ok_or_else(|| Error::not_supported(command.id(), Aggregation::Sharded.describe()))?,
        };
        self.node_mut(&id)
    }

    /// Node owning `key`.
    pub fn get_connection_by_key(&mut self, key: &[u8]) -> Result<&mut BoxedNode> {
        self.ensure_nodes()?;
        let id = self
            .distributor
            .get(key)
            .ok_or_else(|| Error::Routing("no node for key".into()))?;
        self.node_mut(&id)
    }

    /// Node with the given id.
    pub fn get_connection_by_id(&mut self, id: &str) -> Option<&mut BoxedNode> {
        self.pool.iter_mut().find(|n| n.id() == id)
    }

    /// Execute `command` on every node, in insertion order.
    pub fn execute_on_nodes(&mut self, command: &Command) -> Result<Vec<(String, Reply)>> {
        let mut replies = Vec::with_capacity(self.pool.len());
        for node in &mut self.pool {
            let reply = node.execute_command(command)?;
            replies.push((node.id(), reply));
        }
        Ok(replies)
    }

    fn ensure_nodes(&self) -> Result<()> {
        if self.distributor.is_empty() {
            return Err(Error::Routing("sharded cluster has no nodes".into()));
        }
        Ok(())
    }

    fn node_mut(&mut self, id: &str) -> Result<&mut BoxedNode> {
        self.pool
            .iter_mut()
            .find(|n| n.id() == id)
            .ok_or_else(|| Error::Routing(format!("node '{id}' is not in the pool")))
    }

    /// Hash of the routing key, exposed for diagnostics.
    pub fn key_hash(&self, key: &[u8]) -> u32 {
        self.distributor.hash(hash::hash_tag(key))
    }
}

impl Connection for ShardedCluster {
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

    fn node_id(&mut self, command: &Command) -> Result<String> {
        Ok(self.get_connection_by_command(command)?.id())
    }

    fn aggregation(&self) -> Aggregation {
        Aggregation::Sharded
    }
}

impl std::fmt::Debug for ShardedCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedCluster")
            .field("nodes", &self.node_ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandTable;
    use crate::connection::mock::{always_ok, Log, MockConnection};

    fn cluster(log: &Log) -> ShardedCluster {
        let mut cluster = ShardedCluster::new(RingAlgorithm::Crc32);
        for endpoint in ["10.0.0.1:6379", "10.0.0.2:6379", "10.0.0.3:6379"] {
            cluster.add(MockConnection::boxed(endpoint, always_ok(), log.clone()));
        }
        cluster
    }

    #[test]
    fn test_routes_by_key() {
        let log = Log::default();
        let mut cluster = cluster(&log);
        let table = CommandTable::new();

        let command = table.create("SET", vec!["user:1".into(), "x".into()]).unwrap();
        let expected = cluster.distributor().get(b"user:1").unwrap();
        cluster.execute_command(&command).unwrap();
        assert_eq!(log.entries(), vec![format!("{expected} SET user:1 x")]);
        assert_eq!(cluster.node_id(&command).unwrap(), expected);
    }

    #[test]
    fn test_hash_tags_colocate() {
        let log = Log::default();
        let mut cluster = cluster(&log);
        let table = CommandTable::new();

        let same = table.create("MGET", vec!["a{x}1".into(), "b{x}2".into()]).unwrap();
        assert!(cluster.execute_command(&same).is_ok());

        let cross = table.create("MGET", vec!["a{x}".into(), "b{y}".into()]).unwrap();
        let err = cluster.execute_command(&cross).unwrap_err();
        assert_eq!(
            err,
            Error::Routing("Cannot use 'MGET' over a cluster of connections".into())
        );
    }

    #[test]
    fn test_keyless_command_rejected() {
        let log = Log::default();
        let mut cluster = cluster(&log);
        let ping = Command::raw("PING", vec![]);
        assert!(matches!(cluster.execute_command(&ping), Err(Error::Routing(_))));
        assert!(log.entries().is_empty());
    }

    #[test]
    fn test_empty_cluster() {
        let mut cluster = ShardedCluster::new(RingAlgorithm::Ketama);
        let table = CommandTable::new();
        let get = table.create("GET", vec!["k".into()]).unwrap();
        assert!(matches!(cluster.execute_command(&get), Err(Error::Routing(_))));
    }

    #[test]
    fn test_remove_and_readd() {
        let log = Log::default();
        let mut cluster = cluster(&log);
        let before: Vec<_> = (0..100)
            .map(|i| cluster.get_connection_by_key(format!("k{i}").as_bytes()).unwrap().id())
            .collect();

        let removed = cluster.remove_by_id("10.0.0.2:6379").unwrap();
        assert_eq!(cluster.len(), 2);
        for i in 0..100 {
            let id = cluster.get_connection_by_key(format!("k{i}").as_bytes()).unwrap().id();
            assert_ne!(id, "10.0.0.2:6379");
        }

        cluster.add(removed);
        let after: Vec<_> = (0..100)
            .map(|i| cluster.get_connection_by_key(format!("k{i}").as_bytes()).unwrap().id())
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_stale_cached_position_is_recomputed() {
        let log = Log::default();
        let mut cluster = cluster(&log);
        let table = CommandTable::new();
        let command = table.create("GET", vec!["k".into()]).unwrap();
        let owner = cluster.node_id(&command).unwrap();
        cluster.remove_by_id(&owner);
        let next = cluster.node_id(&command).unwrap();
        assert_ne!(next, owner);
    }

    #[test]
    fn test_execute_on_nodes() {
        let log = Log::default();
        let mut cluster = cluster(&log);
        let replies = cluster.execute_on_nodes(&Command::raw("PING", vec![])).unwrap();
        assert_eq!(replies.len(), 3);
        assert_eq!(replies[0].0, "10.0.0.1:6379");
        assert!(replies.iter().all(|(_, r)| *r == Reply::Ok));
        assert_eq!(log.entries().len(), 3);
    }

    #[test]
    fn test_weight_from_parameters() {
        let log = Log::default();
        let mut cluster = ShardedCluster::new(RingAlgorithm::Crc32);
        let params = crate::connection::ConnectionParameters::parse("tcp://10.0.0.9:6379?alias=big&weight=500")
            .unwrap();
        cluster.add(Box::new(MockConnection::with_parameters(params, always_ok(), log.clone())));
        cluster.add(MockConnection::boxed("10.0.0.1:6379", always_ok(), log));
        assert_eq!(cluster.node_ids(), vec!["big".to_string(), "10.0.0.1:6379".to_string()]);
        let big = (0..200)
            .filter(|i| cluster.distributor().get(format!("k{i}").as_bytes()).as_deref() == Some("big"))
            .count();
        assert!(big > 120);
    }
}
