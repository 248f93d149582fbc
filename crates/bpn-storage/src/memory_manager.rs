//! Segment allocator: a hierarchical bitmap tree behind one mutex.
//!
//! Leaves are segment IDs; each interior word marks which child words still
//! have at least one free leaf. Allocation walks the lowest set bit at every
//! level, so segment IDs are handed out smallest-first and allocations
//! cluster at the low end of the address space, which keeps the restart scan
//! short.

use std::sync::Mutex;

use crate::error::StorageError;
use crate::segment::SegmentId;

#[derive(Debug)]
struct TreeBitmaps {
    /// `levels[0]` is the single root word; the last level is the leaf bitmap.
    levels: Vec<Vec<u64>>,
    max_segments: u32,
}

impl TreeBitmaps {
    fn new(max_segments: u32) -> Self {
        let mut sizes = Vec::new();
        let mut words = (max_segments as usize).div_ceil(64).max(1);
        sizes.push(words);
        while words > 1 {
            words = words.div_ceil(64);
            sizes.push(words);
        }
        sizes.reverse();

        let mut levels: Vec<Vec<u64>> = sizes.iter().map(|&n| vec![0u64; n]).collect();

        // mark [0, max_segments) free in the leaves
        let leaf = levels.len() - 1;
        for id in 0..max_segments {
            levels[leaf][(id / 64) as usize] |= 1u64 << (id % 64);
        }
        // build interior occupancy bottom-up
        for l in (0..leaf).rev() {
            for w in 0..levels[l].len() {
                let mut word = 0u64;
                for b in 0..64 {
                    let child = w * 64 + b;
                    if child < levels[l + 1].len() && levels[l + 1][child] != 0 {
                        word |= 1u64 << b;
                    }
                }
                levels[l][w] = word;
            }
        }
        TreeBitmaps {
            levels,
            max_segments,
        }
    }

    fn first_free(&self) -> Option<SegmentId> {
        let mut idx = 0usize;
        for level in &self.levels {
            let word = *level.get(idx)?;
            if word == 0 {
                return None;
            }
            idx = idx * 64 + word.trailing_zeros() as usize;
        }
        Some(idx as SegmentId)
    }

    fn is_free(&self, id: SegmentId) -> bool {
        if id >= self.max_segments {
            return false;
        }
        let leaf = self.levels.len() - 1;
        self.levels[leaf][(id / 64) as usize] & (1u64 << (id % 64)) != 0
    }

    /// Clear the leaf bit for `id`, propagating emptiness upward.
    /// Returns false if the segment was already in use.
    fn mark_used(&mut self, id: SegmentId) -> bool {
        if id >= self.max_segments || !self.is_free(id) {
            return false;
        }
        let leaf = self.levels.len() - 1;
        let mut idx = (id / 64) as usize;
        self.levels[leaf][idx] &= !(1u64 << (id % 64));
        for l in (0..leaf).rev() {
            if self.levels[l + 1][idx] != 0 {
                break;
            }
            let (pw, pb) = (idx / 64, idx % 64);
            self.levels[l][pw] &= !(1u64 << pb);
            idx = pw;
        }
        true
    }

    /// Set the leaf bit for `id`, propagating occupancy upward.
    /// Returns false if the segment was already free.
    fn mark_free(&mut self, id: SegmentId) -> bool {
        if id >= self.max_segments || self.is_free(id) {
            return false;
        }
        let leaf = self.levels.len() - 1;
        let mut idx = (id / 64) as usize;
        self.levels[leaf][idx] |= 1u64 << (id % 64);
        for l in (0..leaf).rev() {
            let (pw, pb) = (idx / 64, idx % 64);
            if self.levels[l][pw] & (1u64 << pb) != 0 {
                break;
            }
            self.levels[l][pw] |= 1u64 << pb;
            idx = pw;
        }
        true
    }
}

/// Thread-safe owner of the free/used state of all storage segments.
#[derive(Debug)]
#[must_use]
pub struct MemoryManager {
    tree: Mutex<TreeBitmaps>,
    max_segments: u32,
}

impl MemoryManager {
    pub fn new(max_segments: u32) -> Self {
        MemoryManager {
            tree: Mutex::new(TreeBitmaps::new(max_segments)),
            max_segments,
        }
    }

    /// Total number of segments in the address space.
    #[must_use]
    pub fn max_segments(&self) -> u32 {
        self.max_segments
    }

    /// Atomically allocate `count` segments, smallest IDs first.
    ///
    /// Either all `count` segments are allocated or none are.
    pub fn allocate_segments(&self, count: u64) -> Result<Vec<SegmentId>, StorageError> {
        let mut tree = self.tree.lock().expect("memory manager mutex poisoned");
        let mut chain = Vec::with_capacity(count as usize);
        for _ in 0..count {
            match tree.first_free() {
                Some(id) => {
                    tree.mark_used(id);
                    chain.push(id);
                }
                None => {
                    for id in &chain {
                        tree.mark_free(*id);
                    }
                    return Err(StorageError::OutOfSpace { requested: count });
                }
            }
        }
        Ok(chain)
    }

    /// Return a chain's segments to the free pool.
    ///
    /// Frees every not-currently-free segment in the list; reports the first
    /// double-free seen, if any.
    pub fn free_segments(&self, chain: &[SegmentId]) -> Result<(), StorageError> {
        let mut tree = self.tree.lock().expect("memory manager mutex poisoned");
        let mut first_double_free = None;
        for &id in chain {
            if !tree.mark_free(id) && first_double_free.is_none() {
                first_double_free = Some(id);
            }
        }
        match first_double_free {
            Some(segment_id) => Err(StorageError::DoubleFree { segment_id }),
            None => Ok(()),
        }
    }

    /// Inspection used by the restore scan.
    #[must_use]
    pub fn is_segment_free(&self, id: SegmentId) -> bool {
        self.tree
            .lock()
            .expect("memory manager mutex poisoned")
            .is_free(id)
    }

    /// Unchecked allocation of a specific ID; restore only.
    pub fn allocate_specific(&self, id: SegmentId) {
        self.tree
            .lock()
            .expect("memory manager mutex poisoned")
            .mark_used(id);
    }

    /// Snapshot of the leaf bitmap, for tests and restore verification.
    #[must_use]
    pub fn backup(&self) -> Vec<u64> {
        let tree = self.tree.lock().expect("memory manager mutex poisoned");
        let leaf = tree.levels.len() - 1;
        tree.levels[leaf].clone()
    }

    /// Compare the current leaf bitmap against a previous snapshot.
    #[must_use]
    pub fn is_backup_equal(&self, backup: &[u64]) -> bool {
        let tree = self.tree.lock().expect("memory manager mutex poisoned");
        let leaf = tree.levels.len() - 1;
        tree.levels[leaf].as_slice() == backup
    }

    /// Number of currently free segments.
    #[must_use]
    pub fn num_free(&self) -> u64 {
        let tree = self.tree.lock().expect("memory manager mutex poisoned");
        let leaf = tree.levels.len() - 1;
        tree.levels[leaf].iter().map(|w| w.count_ones() as u64).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_is_smallest_first() {
        let mm = MemoryManager::new(1024);
        let chain = mm.allocate_segments(4).unwrap();
        assert_eq!(chain, vec![0, 1, 2, 3]);
        let chain2 = mm.allocate_segments(2).unwrap();
        assert_eq!(chain2, vec![4, 5]);
    }

    #[test]
    fn test_freed_ids_are_reused_lowest_first() {
        let mm = MemoryManager::new(1024);
        let a = mm.allocate_segments(6).unwrap();
        mm.free_segments(&[a[1], a[3]]).unwrap();
        let b = mm.allocate_segments(3).unwrap();
        assert_eq!(b, vec![1, 3, 6]);
    }

    #[test]
    fn test_out_of_space_is_all_or_nothing() {
        let mm = MemoryManager::new(8);
        mm.allocate_segments(5).unwrap();
        let before = mm.backup();
        assert!(matches!(
            mm.allocate_segments(4),
            Err(StorageError::OutOfSpace { requested: 4 })
        ));
        // failed allocation must not leak partial reservations
        assert!(mm.is_backup_equal(&before));
        assert_eq!(mm.num_free(), 3);
    }

    #[test]
    fn test_double_free_reported() {
        let mm = MemoryManager::new(64);
        let chain = mm.allocate_segments(2).unwrap();
        mm.free_segments(&chain).unwrap();
        assert!(matches!(
            mm.free_segments(&chain),
            Err(StorageError::DoubleFree { .. })
        ));
    }

    #[test]
    fn test_is_free_and_allocate_specific() {
        let mm = MemoryManager::new(128);
        assert!(mm.is_segment_free(100));
        mm.allocate_specific(100);
        assert!(!mm.is_segment_free(100));
        // out-of-range IDs are never free
        assert!(!mm.is_segment_free(128));
        assert!(!mm.is_segment_free(u32::MAX));
    }

    #[test]
    fn test_backup_roundtrip() {
        let mm = MemoryManager::new(256);
        let empty = mm.backup();
        let chain = mm.allocate_segments(10).unwrap();
        assert!(!mm.is_backup_equal(&empty));
        mm.free_segments(&chain).unwrap();
        assert!(mm.is_backup_equal(&empty));
    }

    #[test]
    fn test_exhaustion_boundary() {
        let mm = MemoryManager::new(65);
        // more than one leaf word
        let chain = mm.allocate_segments(65).unwrap();
        assert_eq!(chain.len(), 65);
        assert_eq!(chain[64], 64);
        assert_eq!(mm.num_free(), 0);
        assert!(matches!(
            mm.allocate_segments(1),
            Err(StorageError::OutOfSpace { .. })
        ));
        mm.free_segments(&[64]).unwrap();
        assert_eq!(mm.allocate_segments(1).unwrap(), vec![64]);
    }

    #[test]
    fn test_multi_level_tree() {
        // 64*64 + 1 segments forces three bitmap levels
        let mm = MemoryManager::new(64 * 64 + 1);
        let chain = mm.allocate_segments(64 * 64 + 1).unwrap();
        assert_eq!(chain.len(), 64 * 64 + 1);
        assert_eq!(*chain.last().unwrap(), 64 * 64);
        assert_eq!(mm.num_free(), 0);
        mm.free_segments(&chain).unwrap();
        assert_eq!(mm.num_free(), 64 * 64 + 1);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn alloc_free_preserves_bitmap(
            sizes in proptest::collection::vec(1u64..50, 1..10),
        ) {
            let mm = MemoryManager::new(4096);
            let initial = mm.backup();
            let chains: Vec<Vec<SegmentId>> = sizes
                .iter()
                .map(|&n| mm.allocate_segments(n).unwrap())
                .collect();

            // all allocated IDs are unique
            let mut all: Vec<SegmentId> = chains.iter().flatten().copied().collect();
            let total = all.len();
            all.sort_unstable();
            all.dedup();
            prop_assert_eq!(all.len(), total);

            for chain in &chains {
                mm.free_segments(chain).unwrap();
            }
            prop_assert!(mm.is_backup_equal(&initial));
        }
    }
}
