//! Cluster routing.
//!
//! Two aggregate connections live here:
//!
//! - [`ShardedCluster`] spreads keys over independent nodes with a
//!   client-side consistent-hash ring ([`HashRing`]).
//! - [`RedisCluster`] talks to a server-assisted cluster: keys map to one
//!   of 16384 slots, the owning node is looked up in a [`SlotMap`] and
//!   `MOVED`/`ASK` redirections are followed once.
//!
//! Both refuse commands whose keys do not share a slot.

pub mod distributor;
pub mod hash;
pub mod redis;
pub mod sharded;
pub mod slots;
pub mod strategy;

pub use distributor::{Distributor, HashRing};
pub use hash::key_slot;
pub use redis::RedisCluster;
pub use sharded::ShardedCluster;
pub use slots::{Slot, SlotMap, SlotRange};
pub use strategy::{ClusterStrategy, RingStrategy, SlotStrategy};
