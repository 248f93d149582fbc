//! The destination × priority × expiration catalog of stored chains.
//!
//! Pops always prefer the highest priority, then the earliest expiration
//! among the caller's available destinations, then LIFO order within one
//! expiration bucket (new chains are pushed to the front and popped from
//! the front).

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::segment::SegmentId;

/// Number of bundle priorities (bulk, normal, expedited).
pub const NUM_PRIORITIES: usize = 3;

/// Absolute expiration in seconds since the bundle epoch.
pub type AbsExpiration = u64;

/// The size and segment chain of one stored bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[must_use]
pub struct ChainInfo {
    pub bundle_size_bytes: u64,
    pub segment_chain: Vec<SegmentId>,
}

type ExpirationMap = BTreeMap<AbsExpiration, VecDeque<ChainInfo>>;

#[derive(Debug, Default)]
struct PriorityArray {
    by_priority: [ExpirationMap; NUM_PRIORITIES],
}

/// A chain detached from the catalog by [`Catalog::pop_front`].
#[derive(Debug)]
#[must_use]
pub struct PoppedChain {
    pub chain: ChainInfo,
    pub dest_node: u64,
    pub priority_index: u8,
    pub abs_expiration: AbsExpiration,
}

/// In-memory index of every cataloged chain.
#[derive(Debug, Default)]
#[must_use]
pub struct Catalog {
    dest_map: HashMap<u64, PriorityArray>,
    num_chains: u64,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a chain at the front of its expiration bucket.
    pub fn insert_front(
        &mut self,
        dest_node: u64,
        priority_index: u8,
        abs_expiration: AbsExpiration,
        chain: ChainInfo,
    ) {
        let priority_array = self.dest_map.entry(dest_node).or_default();
        priority_array.by_priority[priority_index as usize]
            .entry(abs_expiration)
            .or_default()
            .push_front(chain);
        self.num_chains += 1;
    }

    /// Detach the best chain among the given destinations.
    ///
    /// Scans priorities from expedited down to bulk; within a priority picks
    /// the smallest expiration across the supplied destinations only, and
    /// within that bucket pops the front. Destinations not listed are never
    /// considered.
    pub fn pop_front(&mut self, available_dest_nodes: &[u64]) -> Option<PoppedChain> {
        for priority in (0..NUM_PRIORITIES).rev() {
            let mut best: Option<(u64, AbsExpiration)> = None;
            for &dest in available_dest_nodes {
                let Some(priority_array) = self.dest_map.get(&dest) else {
                    continue;
                };
                if let Some((&expiration, _)) =
                    priority_array.by_priority[priority].first_key_value()
                {
                    if best.map_or(true, |(_, e)| expiration < e) {
                        best = Some((dest, expiration));
                    }
                }
            }
            if let Some((dest, expiration)) = best {
                let expiration_map = &mut self
                    .dest_map
                    .get_mut(&dest)
                    .expect("destination found above")
                    .by_priority[priority];
                let bucket = expiration_map
                    .get_mut(&expiration)
                    .expect("expiration found above");
                let chain = bucket.pop_front().expect("bucket is non-empty");
                if bucket.is_empty() {
                    expiration_map.remove(&expiration);
                }
                self.num_chains -= 1;
                return Some(PoppedChain {
                    chain,
                    dest_node: dest,
                    priority_index: priority as u8,
                    abs_expiration: expiration,
                });
            }
        }
        None
    }

    /// Re-insert a popped chain at the front of its original bucket (used
    /// when transmission fails without consuming custody).
    pub fn return_front(&mut self, popped: PoppedChain) {
        self.insert_front(
            popped.dest_node,
            popped.priority_index,
            popped.abs_expiration,
            popped.chain,
        );
    }

    /// Number of chains currently cataloged.
    #[must_use]
    pub fn num_chains(&self) -> u64 {
        self.num_chains
    }
}
