//! Slot map for server-assisted clusters.

use crate::error::{Error, Result};
use crate::CLUSTER_SLOTS;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Slot number (0-16383).
pub type Slot = u16;

/// Highest valid slot.
pub const MAX_SLOT: Slot = (CLUSTER_SLOTS - 1) as Slot;

/// A contiguous, inclusive range of slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotRange {
    pub start: Slot,
    pub end: Slot,
}

impl SlotRange {
    /// Create a new slot range.
    #[must_use]
    pub fn new(start: Slot, end: Slot) -> Self {
        Self { start, end }
    }

    /// Check if a slot is within this range.
    #[must_use]
    pub fn contains(&self, slot: Slot) -> bool {
        slot >= self.start && slot <= self.end
    }

    /// Number of slots in this range.
    #[must_use]
    pub fn len(&self) -> usize {
        usize::from(self.end.saturating_sub(self.start)) + 1
    }

    fn validate(&self) -> Result<()> {
        if self.start > self.end || self.end > MAX_SLOT {
            return Err(Error::Client(format!(
                "invalid slot range {}-{}",
                self.start, self.end
            )));
        }
        Ok(())
    }
}

impl From<(u16, u16)> for SlotRange {
    fn from((start, end): (u16, u16)) -> Self {
        Self::new(start, end)
    }
}

/// Slot to node-id assignments known to the client.
///
/// Entries come from static slot ranges, `MOVED` redirections or a
/// `CLUSTER SLOTS` snapshot. Slots without an entry are unknown, not
/// unassigned.
#[derive(Debug, Clone, Default)]
pub struct SlotMap {
    slots: BTreeMap<Slot, Arc<str>>,
}

impl SlotMap {
    /// Create an empty slot map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign every slot in `range` to `node`.
    pub fn set_slots(&mut self, range: SlotRange, node: &str) -> Result<()> {
        range.validate()?;
        let node: Arc<str> = Arc::from(node);
        for slot in range.start..=range.end {
            self.slots.insert(slot, Arc::clone(&node));
        }
        Ok(())
    }

    /// Assign one slot.
    pub fn insert(&mut self, slot: Slot, node: &str) -> Result<()> {
        self.set_slots(SlotRange::new(slot, slot), node)
    }

    /// Node owning `slot`, if known.
    pub fn get(&self, slot: Slot) -> Option<&str> {
        self.slots.get(&slot).map(|node| &**node)
    }

    /// Forget every assignment.
    pub fn clear(&mut self) {
        self.slots.clear();
    }

    /// Number of assigned slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if no slot is assigned.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Distinct node ids, in slot order.
    pub fn nodes(&self) -> Vec<&str> {
        let mut nodes: Vec<&str> = Vec::new();
        for node in self.slots.values() {
            if !nodes.contains(&&**node) {
                nodes.push(node);
            }
        }
        nodes
    }
}
