//! Mapping commands to routing slots.

use super::distributor::Distributor;
use super::hash;
use crate::command::Command;

/// Computes the routing slot of a command from its keys.
pub trait ClusterStrategy {
    /// Slot of a single key (hash tag applied).
    fn key_slot(&self, key: &[u8]) -> Option<u32>;

    /// Slot shared by every key of `command`, computed from scratch.
    ///
    /// Returns `None` when the command has no keys or its keys map to
    /// different slots.
    fn keys_slot(&self, command: &Command) -> Option<u32> {
        let keys = command.keys();
        let (first, rest) = keys.split_first()?;
        let slot = self.key_slot(first)?;
        for key in rest {
            if self.key_slot(key)? != slot {
                return None;
            }
        }
        Some(slot)
    }

    /// Like [`ClusterStrategy::keys_slot`], cached on the command.
    fn command_slot(&self, command: &Command) -> Option<u32> {
        if let Some(slot) = command.slot() {
            return Some(slot);
        }
        let slot = self.keys_slot(command)?;
        command.set_slot(slot);
        Some(slot)
    }
}

/// CRC16 slots of a server-assisted cluster.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlotStrategy;

impl ClusterStrategy for SlotStrategy {
    fn key_slot(&self, key: &[u8]) -> Option<u32> {
        Some(u32::from(hash::key_slot(key)))
    }
}

/// Ring positions of a client-side sharded cluster.
pub struct RingStrategy<'a>(pub &'a dyn Distributor);

impl ClusterStrategy for RingStrategy<'_> {
    fn key_slot(&self, key: &[u8]) -> Option<u32> {
        self.0.get_slot(self.0.hash(hash::hash_tag(key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::distributor::HashRing;
    use crate::command::CommandTable;
    use crate::config::RingAlgorithm;

    #[test]
    fn test_single_key_slot_is_cached() {
        let table = CommandTable::new();
        let command = table.create("GET", vec!["foo".into()]).unwrap();
        assert_eq!(SlotStrategy.command_slot(&command), Some(12182));
        assert_eq!(command.slot(), Some(12182));
    }

    #[test]
    fn test_multi_key_slots() {
        let table = CommandTable::new();
        let same = table
            .create("MGET", vec!["a{x}1".into(), "b{x}2".into()])
            .unwrap();
        assert!(SlotStrategy.command_slot(&same).is_some());

        let cross = table
            .create("MGET", vec!["a{x}".into(), "b{y}".into()])
            .unwrap();
        assert_eq!(SlotStrategy.command_slot(&cross), None);
        assert_eq!(cross.slot(), None);
    }

    #[test]
    fn test_keyless_command_has_no_slot() {
        let table = CommandTable::new();
        let ping = table.create("PING", vec![]).unwrap();
        assert_eq!(SlotStrategy.command_slot(&ping), None);
    }

    #[test]
    fn test_ring_strategy() {
        let mut ring = HashRing::new(RingAlgorithm::Crc32);
        ring.add("a", None);
        ring.add("b", None);
        let strategy = RingStrategy(&ring);
        let table = CommandTable::new();
        let command = table
            .create("MSET", vec!["{u}1".into(), "v".into(), "{u}2".into(), "w".into()])
            .unwrap();
        let slot = strategy.command_slot(&command).unwrap();
        assert_eq!(ring.get_by_slot(slot), ring.get(b"u"));
    }
}
