//! Weighted consistent-hash rings.
//!
//! A ring is rebuilt in full from the node list on the first lookup after
//! a membership change. Readers always see either the previous complete
//! ring or trigger a fresh build.

use super::hash;
use crate::config::RingAlgorithm;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Weight assumed for nodes added without one.
pub const DEFAULT_WEIGHT: u32 = 100;

/// Points per node for the CRC32 ring.
const CRC32_REPLICAS: usize = 128;

/// Points per node for the ketama ring (four per MD5 digest).
const KETAMA_REPLICAS: usize = 160;

/// Maps hashed keys to node ids.
pub trait Distributor: Send + Sync {
    /// Add a node, replacing any node with the same id.
    fn add(&mut self, node: &str, weight: Option<u32>);

    /// Remove a node. Unknown ids are ignored.
    fn remove(&mut self, node: &str);

    /// Hash a routing key (hash tag already extracted).
    fn hash(&self, key: &[u8]) -> u32;

    /// Ring position owning `hash`, or `None` on an empty ring.
    fn get_slot(&self, hash: u32) -> Option<u32>;

    /// Node at a ring position returned by [`Distributor::get_slot`].
    fn get_by_slot(&self, slot: u32) -> Option<String>;

    /// Node owning `hash`.
    fn get_by_hash(&self, hash: u32) -> Option<String> {
        self.get_by_slot(self.get_slot(hash)?)
    }

    /// Node owning `key`.
    fn get(&self, key: &[u8]) -> Option<String> {
        self.get_by_hash(self.hash(hash::hash_tag(key)))
    }

    /// Returns true if no node was added.
    fn is_empty(&self) -> bool;
}

type Ring = Arc<BTreeMap<u32, String>>;

/// Consistent-hash ring over weighted nodes.
///
/// The CRC32 variant places `round(weight / total * nodes * 128)` points
/// per node at `crc32("{id}:{i}")` and resolves a hash to the first point
/// at or after it, wrapping to the first point. The ketama variant places
/// four points per `md5("{id}-{i}")` digest and resolves a hash to the
/// last point at or before it, wrapping to the last point.
pub struct HashRing {
    algorithm: RingAlgorithm,
    nodes: Vec<(String, u32)>,
    ring: RwLock<Option<Ring>>,
}

impl HashRing {
    /// Create an empty ring.
    pub fn new(algorithm: RingAlgorithm) -> Self {
        Self {
            algorithm,
            nodes: Vec::new(),
            ring: RwLock::new(None),
        }
    }

    /// Ring algorithm.
    pub fn algorithm(&self) -> RingAlgorithm {
        self.algorithm
    }

    /// Node ids in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|(id, _)| id.as_str())
    }

    /// Number of points on the ring.
    pub fn points(&self) -> usize {
        self.ring().len()
    }

    fn invalidate(&mut self) {
        *self.ring.get_mut() = None;
    }

    fn ring(&self) -> Ring {
        if let Some(ring) = self.ring.read().as_ref() {
            return Arc::clone(ring);
        }
        let mut guard = self.ring.write();
        if let Some(ring) = guard.as_ref() {
            return Arc::clone(ring);
        }
        let ring = Arc::new(self.build());
        debug!(
            nodes = self.nodes.len(),
            points = ring.len(),
            algorithm = ?self.algorithm,
            "hash ring rebuilt"
        );
        *guard = Some(Arc::clone(&ring));
        ring
    }

    fn build(&self) -> BTreeMap<u32, String> {
        let mut ring = BTreeMap::new();
        let total: u64 = self.nodes.iter().map(|(_, w)| u64::from(*w)).sum();
        if total == 0 {
            return ring;
        }
        let count = self.nodes.len() as f64;

        for (id, weight) in &self.nodes {
            let ratio = f64::from(*weight) / total as f64;
            match self.algorithm {
                RingAlgorithm::Crc32 => {
                    let points = (ratio * count * CRC32_REPLICAS as f64).round() as usize;
                    for i in 0..points {
                        ring.insert(hash::crc32(format!("{id}:{i}").as_bytes()), id.clone());
                    }
                }
                RingAlgorithm::Ketama => {
                    let digests = (ratio * count * KETAMA_REPLICAS as f64 / 4.0).floor() as usize;
                    for i in 0..digests {
                        for point in hash::md5_words(format!("{id}-{i}").as_bytes()) {
                            ring.insert(point, id.clone());
                        }
                    }
                }
            }
        }
        ring
    }
}

impl Distributor for HashRing {
    fn add(&mut self, node: &str, weight: Option<u32>) {
        let weight = weight.unwrap_or(DEFAULT_WEIGHT);
        match self.nodes.iter_mut().find(|(id, _)| id == node) {
            Some(entry) => entry.1 = weight,
            None => self.nodes.push((node.to_string(), weight)),
        }
        self.invalidate();
    }

    fn remove(&mut self, node: &str) {
        let before = self.nodes.len();
        self.nodes.retain(|(id, _)| id != node);
        if self.nodes.len() != before {
            self.invalidate();
        }
    }

    fn hash(&self, key: &[u8]) -> u32 {
        match self.algorithm {
            RingAlgorithm::Crc32 => hash::crc32(key),
            RingAlgorithm::Ketama => hash::md5_words(key)[0],
        }
    }

    fn get_slot(&self, hash: u32) -> Option<u32> {
        let ring = self.ring();
        let position = match self.algorithm {
            RingAlgorithm::Crc32 => ring
                .range(hash..)
                .next()
                .or_else(|| ring.iter().next()),
            RingAlgorithm::Ketama => ring
                .range(..=hash)
                .next_back()
                .or_else(|| ring.iter().next_back()),
        };
        position.map(|(point, _)| *point)
    }

    fn get_by_slot(&self, slot: u32) -> Option<String> {
        self.ring().get(&slot).cloned()
    }

    fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl std::fmt::Debug for HashRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashRing")
            .field("algorithm", &self.algorithm)
            .field("nodes", &self.nodes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(algorithm: RingAlgorithm, nodes: &[&str]) -> HashRing {
        let mut ring = HashRing::new(algorithm);
        for node in nodes {
            ring.add(node, None);
        }
        ring
    }

    fn mapping(ring: &HashRing) -> Vec<Option<String>> {
        (0..500).map(|i| ring.get(format!("key:{i}").as_bytes())).collect()
    }

    #[test]
    fn test_empty_ring() {
        let ring = HashRing::new(RingAlgorithm::Crc32);
        assert!(ring.is_empty());
        assert_eq!(ring.get(b"foo"), None);
        assert_eq!(ring.get_slot(42), None);
    }

    #[test]
    fn test_point_counts() {
        let crc = ring(RingAlgorithm::Crc32, &["a", "b"]);
        assert_eq!(crc.points(), 256);
        let ketama = ring(RingAlgorithm::Ketama, &["a", "b"]);
        assert_eq!(ketama.points(), 320);
    }

    #[test]
    fn test_weights_skew_points() {
        let mut ring = HashRing::new(RingAlgorithm::Crc32);
        ring.add("heavy", Some(300));
        ring.add("light", Some(100));
        let heavy = mapping(&ring).iter().filter(|n| n.as_deref() == Some("heavy")).count();
        assert!(heavy > 250, "heavy node got {heavy} of 500 keys");
    }

    #[test]
    fn test_successor_and_predecessor_lookup() {
        let crc = ring(RingAlgorithm::Crc32, &["a", "b", "c"]);
        let points: Vec<u32> = crc.ring().keys().copied().collect();
        assert_eq!(crc.get_slot(points[3] - 1), Some(points[3]));
        assert_eq!(crc.get_slot(points[3]), Some(points[3]));
        assert_eq!(crc.get_slot(u32::MAX), Some(points[0]));

        let ketama = ring(RingAlgorithm::Ketama, &["a", "b", "c"]);
        let points: Vec<u32> = ketama.ring().keys().copied().collect();
        assert_eq!(ketama.get_slot(points[3] + 1), Some(points[3]));
        if points[0] > 0 {
            assert_eq!(ketama.get_slot(points[0] - 1), points.last().copied());
        }
    }

    #[test]
    fn test_add_remove_restores_mapping() {
        for algorithm in [RingAlgorithm::Crc32, RingAlgorithm::Ketama] {
            let mut ring = ring(algorithm, &["a", "b", "c"]);
            let before = mapping(&ring);
            ring.add("d", None);
            assert_ne!(mapping(&ring), before);
            ring.remove("d");
            assert_eq!(mapping(&ring), before);
        }
    }

    #[test]
    fn test_hash_tag_colocation() {
        let ring = ring(RingAlgorithm::Crc32, &["a", "b", "c", "d"]);
        let first = ring.get(b"a{x}1");
        assert_eq!(first, ring.get(b"b{x}2"));
        assert_eq!(ring.hash(hash::hash_tag(b"a{x}1")), ring.hash(b"x"));
    }

    #[test]
    fn test_readd_updates_weight() {
        let mut ring = ring(RingAlgorithm::Crc32, &["a", "b"]);
        ring.add("a", Some(300));
        assert_eq!(ring.nodes().count(), 2);
        assert_eq!(ring.points(), 256);
    }
}
